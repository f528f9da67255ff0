//! Wired pairing link: a dedicated UART between stage and PC receiver, with
//! a cable-detect input that goes high when the other unit is attached.

use esp_hal::gpio::Input;
use esp_hal::uart::{RxError, TxError, Uart};
use esp_hal::Async;

use crate::transport::PairingLink;

#[derive(Debug)]
pub enum LinkError {
    Rx(RxError),
    Tx(TxError),
}

pub struct UartLink {
    uart: Uart<'static, Async>,
    detect: Input<'static>,
}

impl UartLink {
    pub fn new(uart: Uart<'static, Async>, detect: Input<'static>) -> Self {
        Self { uart, detect }
    }
}

impl PairingLink for UartLink {
    type Error = LinkError;

    async fn enter_pairing_mode(&mut self) -> Result<(), LinkError> {
        // Drop whatever the peer sent before this attempt.
        let mut scratch = [0u8; 64];
        while self.uart.read_buffered(&mut scratch).map_err(LinkError::Rx)? > 0 {}
        log::debug!("Pairing link open");
        Ok(())
    }

    async fn exit_pairing_mode(&mut self) -> Result<(), LinkError> {
        self.uart.flush_async().await.map_err(LinkError::Tx)?;
        log::debug!("Pairing link closed");
        Ok(())
    }

    async fn wait_for_peer(&mut self) -> Result<(), LinkError> {
        self.detect.wait_for_high().await;
        Ok(())
    }

    async fn write_all(&mut self, mut data: &[u8]) -> Result<(), LinkError> {
        while !data.is_empty() {
            let n = self.uart.write_async(data).await.map_err(LinkError::Tx)?;
            data = &data[n..];
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        self.uart.read_async(buf).await.map_err(LinkError::Rx)
    }
}
