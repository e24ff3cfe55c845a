//! Offline address discovery.
//!
//! Connects to the PLC once, reads every candidate address for every tag, and writes the
//! first candidate that answered per tag as a JSON mapping file for `batch-bridge --map`.
//! Tags without explicit candidates are probed at their built-in default.

use batch_core::{tags, AddressMap, LogicalTag, PhysicalAddress, Protocol};
use batch_io::modbus::DEFAULT_MODBUS_PORT;
use batch_io::s7::frame::ISO_TCP_PORT;
use batch_io::{ModbusConfig, ModbusDriver, PlcDriver, S7Config, S7Driver, SimulatedPlc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
enum ProbeError {
    #[error("{0}")]
    Usage(String),

    #[error("tag {tag}: {source}")]
    Address {
        tag: String,
        source: batch_core::AddressParseError,
    },

    #[error("PLC connect failed: {0}")]
    Connect(batch_io::DriverError),

    #[error("no candidate answered for {0}")]
    NoAnswer(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug)]
struct ProbeArgs {
    protocol: Protocol,
    host: String,
    port: Option<u16>,
    rack: u16,
    slot: u16,
    tsaps: Option<(u16, u16)>,
    unit_id: u8,
    simulate: bool,
    out: Option<PathBuf>,
    candidates: BTreeMap<String, Vec<String>>,
}

fn usage() -> &'static str {
    r#"addr-probe - find working PLC addresses and write a tag mapping file

USAGE:
    addr-probe [OPTIONS] [--candidate TAG=ADDR[,ADDR...]]...

OPTIONS:
    --protocol <NAME>          s7 or modbus [default: s7]
    --plc-host <HOST>          PLC address [default: 127.0.0.1]
    --plc-port <PORT>          PLC port [default: 102 for s7, 502 for modbus]
    --rack <N> / --slot <N>    S7 rack and slot [default: 0 / 1]
    --tsap <LOCAL:REMOTE>      Explicit TSAP pair for LOGO!, e.g. 0x0100:0x0200
    --unit-id <ID>             Modbus unit id [default: 1]
    --candidate <TAG=ADDRS>    Addresses to try for TAG, in order (repeatable)
    --out <PATH>               Write the mapping here instead of stdout
    --simulate                 Probe the in-memory PLC
"#
}

fn parse_u16(text: &str) -> Option<u16> {
    match text.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

impl ProbeArgs {
    fn parse(args: &[String]) -> Result<Option<Self>, ProbeError> {
        let mut parsed = ProbeArgs {
            protocol: Protocol::S7,
            host: "127.0.0.1".to_string(),
            port: None,
            rack: 0,
            slot: 1,
            tsaps: None,
            unit_id: 1,
            simulate: false,
            out: None,
            candidates: BTreeMap::new(),
        };

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--help" | "-h" => return Ok(None),
                "--simulate" => {
                    parsed.simulate = true;
                    i += 1;
                    continue;
                }
                _ => {}
            }
            let value = args
                .get(i + 1)
                .ok_or_else(|| ProbeError::Usage(format!("{flag} needs a value")))?;
            let bad = || ProbeError::Usage(format!("invalid value '{value}' for {flag}"));
            match flag {
                "--protocol" => parsed.protocol = value.parse().map_err(ProbeError::Usage)?,
                "--plc-host" => parsed.host = value.clone(),
                "--plc-port" => parsed.port = Some(value.parse().map_err(|_| bad())?),
                "--rack" => parsed.rack = value.parse().map_err(|_| bad())?,
                "--slot" => parsed.slot = value.parse().map_err(|_| bad())?,
                "--unit-id" => parsed.unit_id = value.parse().map_err(|_| bad())?,
                "--tsap" => {
                    let (local, remote) = value.split_once(':').ok_or_else(bad)?;
                    parsed.tsaps = Some((
                        parse_u16(local).ok_or_else(bad)?,
                        parse_u16(remote).ok_or_else(bad)?,
                    ));
                }
                "--candidate" => {
                    let (tag, addrs) = value.split_once('=').ok_or_else(bad)?;
                    parsed
                        .candidates
                        .entry(tag.trim().to_ascii_uppercase())
                        .or_default()
                        .extend(addrs.split(',').map(|a| a.trim().to_string()));
                }
                "--out" => parsed.out = Some(PathBuf::from(value)),
                other => return Err(ProbeError::Usage(format!("unknown option '{other}'"))),
            }
            i += 2;
        }
        Ok(Some(parsed))
    }

    fn driver(&self) -> Box<dyn PlcDriver> {
        if self.simulate {
            return Box::new(SimulatedPlc::new());
        }
        match self.protocol {
            Protocol::S7 => {
                let port = self.port.unwrap_or(ISO_TCP_PORT);
                let config = match self.tsaps {
                    Some((local, remote)) => S7Config::from_tsaps(self.host.clone(), port, local, remote),
                    None => S7Config::from_rack_slot(self.host.clone(), port, self.rack, self.slot),
                };
                Box::new(S7Driver::new(config))
            }
            Protocol::Modbus => Box::new(ModbusDriver::new(ModbusConfig {
                host: self.host.clone(),
                port: self.port.unwrap_or(DEFAULT_MODBUS_PORT),
                unit_id: self.unit_id,
            })),
        }
    }

    /// Every tag to probe with its candidate addresses, parsed for the chosen protocol.
    fn plan(&self) -> Result<BTreeMap<String, Vec<PhysicalAddress>>, ProbeError> {
        let defaults = AddressMap::builtin(self.protocol);
        let mut plan = BTreeMap::new();
        for tag in tags::KNOWN_TAGS {
            if let Ok(addr) = defaults.resolve(tag.name) {
                plan.insert(tag.name.to_string(), vec![addr]);
            }
        }
        for (tag, texts) in &self.candidates {
            let addrs = texts
                .iter()
                .map(|text| {
                    PhysicalAddress::parse(self.protocol, text).map_err(|source| {
                        ProbeError::Address {
                            tag: tag.clone(),
                            source,
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            plan.insert(tag.clone(), addrs);
        }
        Ok(plan)
    }
}

async fn probe(args: &ProbeArgs) -> Result<AddressMap, ProbeError> {
    let plan = args.plan()?;
    let mut driver = args.driver();
    info!(endpoint = %driver.describe(), tags = plan.len(), "probing");
    driver.connect().await.map_err(ProbeError::Connect)?;

    let mut chosen = Vec::new();
    for (tag, candidates) in &plan {
        let logical = LogicalTag::new(tag.clone());
        let mut found = None;
        for addr in candidates {
            match driver.read_batch(&[(logical.clone(), *addr)]).await {
                Ok(values) => match values.get(&logical) {
                    Some(value) => {
                        info!(tag = %tag, addr = %addr, value = ?value, "candidate answered");
                        found = Some(addr.to_string());
                        break;
                    }
                    None => info!(tag = %tag, addr = %addr, "candidate rejected by PLC"),
                },
                Err(e) => {
                    warn!(tag = %tag, addr = %addr, error = %e, "read failed; reconnecting");
                    driver.disconnect().await;
                    driver.connect().await.map_err(ProbeError::Connect)?;
                }
            }
        }
        match found {
            Some(addr) => chosen.push((tag.clone(), addr)),
            None => {
                driver.disconnect().await;
                return Err(ProbeError::NoAnswer(tag.clone()));
            }
        }
    }
    driver.disconnect().await;

    AddressMap::from_pairs(args.protocol, chosen).map_err(|e| ProbeError::Usage(e.to_string()))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let args = match ProbeArgs::parse(&argv) {
        Ok(Some(args)) => args,
        Ok(None) => {
            println!("{}", usage());
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("error: {e}\n\n{}", usage());
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(probe(&args)).and_then(|map| match &args.out {
        Some(path) => {
            map.write_json(path).map_err(|source| ProbeError::Write {
                path: path.clone(),
                source,
            })?;
            info!(path = %path.display(), tags = map.len(), "mapping written");
            Ok(())
        }
        None => {
            println!("{}", map.to_json());
            Ok(())
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}
