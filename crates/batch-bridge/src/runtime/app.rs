use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use batch_core::{AddressMap, AddressMapError, Protocol};
use batch_io::{
    CommandGateway, CommandObserver, FanoutHub, ModbusConfig, ModbusDriver, PlcDriver, Poller,
    S7Config, S7Driver, ServerBuilder, Session, SimulatedPlc, TokenValidator,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Weight the simulated scale gains per open gate per poll.
const SIM_KG_PER_GATE: i64 = 5;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    AddressMap(#[from] AddressMapError),

    #[error("invalid bind address '{addr}': {source}")]
    BindAddr {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("failed to open audit log {path}: {source}")]
    Audit {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to start server: {0}")]
    Server(std::io::Error),
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("run with --help for usage");
            return ExitCode::from(1);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    run(config)
}

pub fn run(config: RuntimeConfig) -> ExitCode {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bridge failed to start");
            ExitCode::from(1)
        }
    }
}

fn build_driver(config: &RuntimeConfig, map: &AddressMap) -> Box<dyn PlcDriver> {
    if config.simulate {
        let plc = SimulatedPlc::new();
        if !plc.handle().enable_weigh_model(map, SIM_KG_PER_GATE) {
            warn!("mapping has no PESO tag; simulated scale disabled");
        }
        info!("Using simulated PLC");
        return Box::new(plc);
    }

    let port = config.plc_port();
    match config.protocol {
        Protocol::S7 => {
            let s7 = match (config.local_tsap, config.remote_tsap) {
                (Some(local), Some(remote)) => {
                    S7Config::from_tsaps(config.plc_host.clone(), port, local, remote)
                }
                _ => S7Config::from_rack_slot(config.plc_host.clone(), port, config.rack, config.slot),
            };
            info!(
                host = %s7.host,
                port,
                local_tsap = %format!("{:#06x}", s7.local_tsap),
                remote_tsap = %format!("{:#06x}", s7.remote_tsap),
                "Using S7 driver"
            );
            Box::new(S7Driver::new(s7))
        }
        Protocol::Modbus => {
            info!(host = %config.plc_host, port, unit_id = config.unit_id, "Using Modbus TCP driver");
            Box::new(ModbusDriver::new(ModbusConfig {
                host: config.plc_host.clone(),
                port,
                unit_id: config.unit_id,
            }))
        }
    }
}

fn init_audit_logger(path: Option<&PathBuf>) -> Result<Option<Arc<AuditLogger>>, AppError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let logger = AuditLogger::new(path).map_err(|source| AppError::Audit {
        path: path.clone(),
        source,
    })?;
    info!(path = %path.display(), "Audit logging enabled");
    Ok(Some(Arc::new(logger)))
}

async fn wait_for_shutdown(run_seconds: Option<u64>) {
    match run_seconds {
        Some(seconds) => {
            info!(seconds, "Running for limited duration");
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c; running until killed");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        }
    }
}

async fn serve(config: RuntimeConfig) -> Result<(), AppError> {
    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let bind: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|source| AppError::BindAddr {
            addr: config.bind_addr.clone(),
            source,
        })?;

    let map = Arc::new(AddressMap::load(config.protocol, config.map_path.as_deref())?);
    info!(protocol = config.protocol.as_str(), tags = map.len(), "Address map loaded");

    let audit_logger = init_audit_logger(config.audit_path.as_ref())?;
    if let Some(logger) = &audit_logger {
        logger.record(
            AuditEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "protocol": config.protocol.as_str(),
                "simulate": config.simulate,
                "tags": map.len(),
            }),
        );
    }

    let driver = build_driver(&config, &map);
    let session = Arc::new(Session::new(driver, map.clone(), config.session_config()));
    let hub = FanoutHub::default();

    let mut gateway = CommandGateway::new(session.clone(), hub.clone(), config.gateway_config());
    if let Some(logger) = &audit_logger {
        gateway = gateway.with_observer(logger.clone() as Arc<dyn CommandObserver>);
    }
    let gateway = Arc::new(gateway);

    let state_task = audit_logger.clone().map(|logger| {
        let mut states = session.subscribe_state();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                logger.session_state(state);
            }
        })
    });

    let mut builder = ServerBuilder::new(bind, gateway.clone(), hub.clone());
    if let Some(secret) = &config.auth_secret {
        builder = builder.with_auth(TokenValidator::new(
            secret.clone().into_bytes(),
            config.auth_max_age_secs,
        ));
    }
    let server = builder.spawn().await.map_err(AppError::Server)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = Poller::new(session.clone(), hub.clone(), config.poll_interval())
        .with_gateway(gateway.clone());
    let poll_task = tokio::spawn(poller.run(stop_rx));

    info!(
        addr = %server.local_addr(),
        endpoint = %session.endpoint(),
        poll_ms = config.poll_interval_ms,
        "Batch bridge running"
    );

    wait_for_shutdown(config.run_seconds).await;

    let _ = stop_tx.send(true);
    let stats = match poll_task.await {
        Ok(stats) => stats,
        Err(e) => {
            error!(error = %e, "poll task ended abnormally");
            Default::default()
        }
    };
    if let Err(e) = server.shutdown().await {
        warn!(error = %e, "server task ended abnormally");
    }
    let released = gateway.release_all().await;
    if released > 0 {
        warn!(holds = released, "released held outputs at shutdown");
    }
    session.close().await;
    if let Some(task) = state_task {
        task.abort();
    }

    info!(
        ticks = stats.ticks,
        failures = stats.failures,
        partial = stats.partial,
        skipped = stats.skipped,
        "Run complete"
    );
    if let Some(logger) = &audit_logger {
        logger.record(
            AuditEventType::SystemShutdown,
            serde_json::json!({
                "ticks": stats.ticks,
                "failures": stats.failures,
                "partial": stats.partial,
                "skipped": stats.skipped,
            }),
        );
    }
    Ok(())
}
