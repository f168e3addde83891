//! Serial adapter for devices that expose their console over a UART.
use crate::record::TraceSource;
use crate::transport::{ReadStatus, Transport, TransportError, READ_POLL};

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for serialport::StopBits {
    fn from(stop_bits: StopBits) -> Self {
        match stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Seven,
    Eight,
}

impl From<DataBits> for serialport::DataBits {
    fn from(data_bits: DataBits) -> Self {
        match data_bits {
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

fn default_parity() -> Parity {
    Parity::None
}

fn default_stop_bits() -> StopBits {
    StopBits::One
}

fn default_data_bits() -> DataBits {
    DataBits::Eight
}

/// 8N1 unless configured otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    #[serde(default = "default_parity")]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: StopBits,
    #[serde(default = "default_data_bits")]
    pub data_bits: DataBits,
}

pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    path: String,
}

impl SerialTransport {
    pub fn open(config: &SerialConfig) -> Result<Self, TransportError> {
        let port = serialport::new(&config.path, config.baud_rate)
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .data_bits(config.data_bits.into())
            .timeout(READ_POLL)
            .open()?;
        Ok(Self {
            port: Some(port),
            path: config.path.clone(),
        })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, TransportError> {
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return Ok(ReadStatus::Closed),
        };
        match port.read(buf) {
            Ok(0) => Ok(ReadStatus::Closed),
            Ok(n) => Ok(ReadStatus::Data(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(ReadStatus::TimedOut)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn source(&self) -> TraceSource {
        TraceSource::Device
    }

    fn describe(&self) -> String {
        format!("serial ({})", self.path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Configs come from files; omitted framing fields fall back to
    /// 8N1.
    #[test]
    fn config_defaults_to_8n1() {
        let config: SerialConfig =
            serde_json::from_str(r#"{"path": "/dev/ttyUSB3", "baud_rate": 115200}"#).unwrap();
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.data_bits, DataBits::Eight);
    }
}
