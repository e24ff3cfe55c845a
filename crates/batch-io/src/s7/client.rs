use super::frame::{self, S7Error, TPKT_HEADER_LEN};
use crate::driver::{DriverError, PlcDriver};
use async_trait::async_trait;
use batch_core::{LogicalTag, PhysicalAddress, S7Address, TagValue};
use std::collections::BTreeMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// PG connection type used when deriving the remote TSAP from rack and slot.
const CONNECTION_TYPE_PG: u16 = 0x01;
const DEFAULT_LOCAL_TSAP: u16 = 0x0100;

#[derive(Debug, Clone)]
pub struct S7Config {
    pub host: String,
    pub port: u16,
    pub local_tsap: u16,
    pub remote_tsap: u16,
    pub pdu_length: u16,
}

impl S7Config {
    pub fn from_rack_slot(host: impl Into<String>, port: u16, rack: u16, slot: u16) -> Self {
        Self {
            host: host.into(),
            port,
            local_tsap: DEFAULT_LOCAL_TSAP,
            remote_tsap: (CONNECTION_TYPE_PG << 8) + rack * 0x20 + slot,
            pdu_length: frame::DEFAULT_PDU_LENGTH,
        }
    }

    /// LOGO! and other small CPUs are addressed by explicit TSAP pairs.
    pub fn from_tsaps(host: impl Into<String>, port: u16, local_tsap: u16, remote_tsap: u16) -> Self {
        Self {
            host: host.into(),
            port,
            local_tsap,
            remote_tsap,
            pdu_length: frame::DEFAULT_PDU_LENGTH,
        }
    }
}

impl From<S7Error> for DriverError {
    fn from(err: S7Error) -> Self {
        DriverError::Protocol(err.to_string())
    }
}

pub struct S7Driver {
    config: S7Config,
    stream: Option<TcpStream>,
    pdu_length: u16,
    pdu_ref: u16,
}

impl S7Driver {
    pub fn new(config: S7Config) -> Self {
        Self {
            pdu_length: config.pdu_length,
            config,
            stream: None,
            pdu_ref: 0,
        }
    }

    /// PDU length granted by the PLC on the last connect.
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, DriverError> {
        let stream = self.stream.as_mut().ok_or(DriverError::NotConnected)?;
        stream.write_all(request).await?;

        let mut header = [0u8; TPKT_HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let len = frame::frame_length(&header)?;
        let mut telegram = vec![0u8; len];
        telegram[..TPKT_HEADER_LEN].copy_from_slice(&header);
        stream.read_exact(&mut telegram[TPKT_HEADER_LEN..]).await?;
        Ok(telegram)
    }

    async fn read_chunk(
        &mut self,
        chunk: &[(LogicalTag, S7Address)],
        out: &mut BTreeMap<LogicalTag, TagValue>,
    ) -> Result<(), DriverError> {
        let pdu_ref = self.next_ref();
        let addrs: Vec<S7Address> = chunk.iter().map(|(_, addr)| *addr).collect();
        let reply = self
            .exchange(&frame::encode_read_request(pdu_ref, &addrs))
            .await?;
        let items = frame::decode_read_response(&reply, pdu_ref, chunk.len())?;

        for ((tag, addr), item) in chunk.iter().zip(items) {
            match item {
                Ok(bytes) => match frame::decode_value(addr.width, &bytes) {
                    Some(value) => {
                        out.insert(tag.clone(), value);
                    }
                    None => debug!(tag = %tag, len = bytes.len(), "short S7 payload"),
                },
                Err(code) => debug!(
                    tag = %tag,
                    code,
                    reason = frame::describe_return_code(code),
                    "S7 item not served"
                ),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PlcDriver for S7Driver {
    async fn connect(&mut self) -> Result<(), DriverError> {
        self.stream = None;
        let target = (self.config.host.as_str(), self.config.port);
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| DriverError::Connect(format!("{}: {e}", self.describe())))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let request = frame::encode_connect_request(self.config.local_tsap, self.config.remote_tsap);
        let confirm = self.exchange(&request).await?;
        if let Err(e) = frame::check_connect_confirm(&confirm) {
            self.stream = None;
            return Err(DriverError::Connect(e.to_string()));
        }

        let pdu_ref = self.next_ref();
        let reply = self
            .exchange(&frame::encode_setup_comm(pdu_ref, self.config.pdu_length))
            .await?;
        self.pdu_length = frame::decode_setup_comm(&reply, pdu_ref)?;

        info!(
            endpoint = %self.describe(),
            pdu_length = self.pdu_length,
            "S7 session established"
        );
        Ok(())
    }

    async fn read_batch(
        &mut self,
        points: &[(LogicalTag, PhysicalAddress)],
    ) -> Result<BTreeMap<LogicalTag, TagValue>, DriverError> {
        let mut s7_points = Vec::with_capacity(points.len());
        for (tag, addr) in points {
            match addr {
                PhysicalAddress::S7(a) => s7_points.push((tag.clone(), *a)),
                other => return Err(DriverError::UnsupportedAddress(other.to_string())),
            }
        }

        let mut out = BTreeMap::new();
        let per_job = frame::max_items_per_read(self.pdu_length);
        for chunk in s7_points.chunks(per_job) {
            self.read_chunk(chunk, &mut out).await?;
        }
        Ok(out)
    }

    async fn write(&mut self, addr: &PhysicalAddress, value: TagValue) -> Result<(), DriverError> {
        let PhysicalAddress::S7(s7) = addr else {
            return Err(DriverError::UnsupportedAddress(addr.to_string()));
        };
        let payload = frame::encode_value(s7.width, value).ok_or_else(|| {
            DriverError::ValueOutOfRange {
                addr: addr.to_string(),
                value,
            }
        })?;

        let pdu_ref = self.next_ref();
        let reply = self
            .exchange(&frame::encode_write_request(pdu_ref, s7, &payload))
            .await?;
        frame::decode_write_response(&reply, pdu_ref)?.map_err(|code| DriverError::Rejected {
            addr: addr.to_string(),
            reason: frame::describe_return_code(code).to_string(),
        })
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(endpoint = %self.describe(), "S7 session closed");
        }
    }

    fn describe(&self) -> String {
        format!("s7://{}:{}", self.config.host, self.config.port)
    }
}
