use crate::driver::{DriverError, PlcDriver};
use async_trait::async_trait;
use batch_core::{LogicalTag, ModbusAddress, PhysicalAddress, TagValue};
use std::collections::BTreeMap;
use std::io;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{info, warn};

pub const DEFAULT_MODBUS_PORT: u16 = 502;

#[derive(Debug, Clone)]
pub struct ModbusConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_MODBUS_PORT,
            unit_id: 1,
        }
    }
}

/// Modbus TCP driver. Reads go out one request per tag so an exception on one register
/// only drops that tag.
pub struct ModbusDriver {
    config: ModbusConfig,
    ctx: Option<Context>,
}

impl ModbusDriver {
    pub fn new(config: ModbusConfig) -> Self {
        Self { config, ctx: None }
    }

    async fn read_one(ctx: &mut Context, addr: ModbusAddress) -> io::Result<TagValue> {
        let value = match addr {
            ModbusAddress::Coil(n) => TagValue::Bool(first(ctx.read_coils(n, 1).await?)?),
            ModbusAddress::DiscreteInput(n) => {
                TagValue::Bool(first(ctx.read_discrete_inputs(n, 1).await?)?)
            }
            ModbusAddress::HoldingRegister(n) => {
                TagValue::Int(first(ctx.read_holding_registers(n, 1).await?)? as i64)
            }
            ModbusAddress::InputRegister(n) => {
                TagValue::Int(first(ctx.read_input_registers(n, 1).await?)? as i64)
            }
        };
        Ok(value)
    }
}

fn first<T: Copy>(values: Vec<T>) -> io::Result<T> {
    values
        .first()
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty Modbus response"))
}

/// Errors that mean the TCP link itself is gone, as opposed to a Modbus exception.
fn is_link_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WriteZero
    )
}

#[async_trait]
impl PlcDriver for ModbusDriver {
    async fn connect(&mut self) -> Result<(), DriverError> {
        self.ctx = None;
        let socket_addr = tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| DriverError::Connect(format!("{}: {e}", self.describe())))?
            .next()
            .ok_or_else(|| DriverError::Connect(format!("{}: no address", self.describe())))?;

        let ctx = tcp::connect_slave(socket_addr, Slave(self.config.unit_id))
            .await
            .map_err(|e| DriverError::Connect(format!("{}: {e}", self.describe())))?;
        self.ctx = Some(ctx);
        info!(endpoint = %self.describe(), unit = self.config.unit_id, "Modbus session established");
        Ok(())
    }

    async fn read_batch(
        &mut self,
        points: &[(LogicalTag, PhysicalAddress)],
    ) -> Result<BTreeMap<LogicalTag, TagValue>, DriverError> {
        let ctx = self.ctx.as_mut().ok_or(DriverError::NotConnected)?;
        let mut out = BTreeMap::new();
        for (tag, addr) in points {
            let PhysicalAddress::Modbus(addr) = addr else {
                return Err(DriverError::UnsupportedAddress(addr.to_string()));
            };
            match Self::read_one(ctx, *addr).await {
                Ok(value) => {
                    out.insert(tag.clone(), value);
                }
                Err(e) if is_link_error(&e) => return Err(DriverError::Io(e)),
                Err(e) => warn!(tag = %tag, error = %e, "Modbus read dropped tag"),
            }
        }
        Ok(out)
    }

    async fn write(&mut self, addr: &PhysicalAddress, value: TagValue) -> Result<(), DriverError> {
        let ctx = self.ctx.as_mut().ok_or(DriverError::NotConnected)?;
        let out_of_range = || DriverError::ValueOutOfRange {
            addr: addr.to_string(),
            value,
        };
        let result = match (addr, value) {
            (PhysicalAddress::Modbus(ModbusAddress::Coil(n)), TagValue::Bool(b)) => {
                ctx.write_single_coil(*n, b).await
            }
            (PhysicalAddress::Modbus(ModbusAddress::HoldingRegister(n)), TagValue::Int(v)) => {
                let word = u16::try_from(v).map_err(|_| out_of_range())?;
                ctx.write_single_register(*n, word).await
            }
            (PhysicalAddress::Modbus(ModbusAddress::Coil(_)), _)
            | (PhysicalAddress::Modbus(ModbusAddress::HoldingRegister(_)), _) => {
                return Err(out_of_range())
            }
            _ => return Err(DriverError::UnsupportedAddress(addr.to_string())),
        };
        result.map_err(|e| {
            if is_link_error(&e) {
                DriverError::Io(e)
            } else {
                DriverError::Rejected {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }

    async fn disconnect(&mut self) {
        self.ctx = None;
    }

    fn describe(&self) -> String {
        format!("modbus://{}:{}", self.config.host, self.config.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceptions_are_not_link_errors() {
        let exception = io::Error::new(io::ErrorKind::Other, "Illegal data address");
        assert!(!is_link_error(&exception));
        assert!(is_link_error(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(is_link_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }

    #[tokio::test]
    async fn operations_before_connect_fail_fast() {
        let mut driver = ModbusDriver::new(ModbusConfig::default());
        let points = vec![(
            LogicalTag::from("PESO"),
            PhysicalAddress::Modbus(ModbusAddress::HoldingRegister(3)),
        )];
        assert!(matches!(
            driver.read_batch(&points).await,
            Err(DriverError::NotConnected)
        ));
        assert!(matches!(
            driver
                .write(
                    &PhysicalAddress::Modbus(ModbusAddress::Coil(1)),
                    TagValue::Bool(true)
                )
                .await,
            Err(DriverError::NotConnected)
        ));
    }

    #[test]
    fn describe_names_endpoint() {
        let driver = ModbusDriver::new(ModbusConfig {
            host: "plc.local".into(),
            port: 1502,
            unit_id: 3,
        });
        assert_eq!(driver.describe(), "modbus://plc.local:1502");
    }
}
