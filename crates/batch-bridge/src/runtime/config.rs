use batch_core::{CommandLimits, Protocol};
use batch_io::modbus::DEFAULT_MODBUS_PORT;
use batch_io::s7::frame::ISO_TCP_PORT;
use batch_io::{GatewayConfig, SessionConfig};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} needs a value")]
    MissingValue(String),

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown option '{0}'")]
    UnknownOption(String),
}

/// Environment variables and the flag each one stands in for. Flags win over the environment.
const ENV_FLAGS: &[(&str, &str)] = &[
    ("BATCH_PROTOCOL", "--protocol"),
    ("BATCH_PLC_HOST", "--plc-host"),
    ("BATCH_PLC_PORT", "--plc-port"),
    ("BATCH_RACK", "--rack"),
    ("BATCH_SLOT", "--slot"),
    ("BATCH_LOCAL_TSAP", "--local-tsap"),
    ("BATCH_REMOTE_TSAP", "--remote-tsap"),
    ("BATCH_UNIT_ID", "--unit-id"),
    ("BATCH_POLL_INTERVAL_MS", "--poll-interval-ms"),
    ("BATCH_CONNECT_TIMEOUT_MS", "--connect-timeout-ms"),
    ("BATCH_IO_TIMEOUT_MS", "--io-timeout-ms"),
    ("BATCH_ARIDO_MAX", "--arido-max"),
    ("BATCH_PULSE_MS", "--pulse-ms"),
    ("BATCH_HOLD_TIMEOUT_MS", "--hold-timeout-ms"),
    ("BATCH_MAP", "--map"),
    ("BATCH_BIND", "--bind"),
    ("BATCH_METRICS_ADDR", "--metrics-addr"),
    ("BATCH_AUDIT_LOG", "--audit-log"),
    ("BATCH_LOG_DIR", "--log-dir"),
    ("BATCH_AUTH_SECRET", "--auth-secret"),
    ("BATCH_AUTH_MAX_AGE", "--auth-max-age"),
    ("BATCH_RUN_SECONDS", "--run-seconds"),
    ("BATCH_JSON_LOGS", "--json-logs"),
    ("BATCH_SIMULATE", "--simulate"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    pub bind_addr: String,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub auth_secret: Option<String>,
    pub auth_max_age_secs: u64,
    pub protocol: Protocol,
    pub plc_host: String,
    pub plc_port: Option<u16>,
    pub rack: u16,
    pub slot: u16,
    pub local_tsap: Option<u16>,
    pub remote_tsap: Option<u16>,
    pub unit_id: u8,
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub arido_max: f64,
    pub pulse_ms: u64,
    pub hold_timeout_ms: u64,
    pub map_path: Option<PathBuf>,
    pub simulate: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            bind_addr: "127.0.0.1:8080".to_string(),
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
            auth_secret: None,
            auth_max_age_secs: 8 * 60 * 60,
            protocol: Protocol::S7,
            plc_host: "127.0.0.1".to_string(),
            plc_port: None,
            rack: 0,
            slot: 1,
            local_tsap: None,
            remote_tsap: None,
            unit_id: 1,
            poll_interval_ms: 1000,
            connect_timeout_ms: 2000,
            io_timeout_ms: 2000,
            arido_max: 100.0,
            pulse_ms: 100,
            hold_timeout_ms: 5000,
            map_path: None,
            simulate: false,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// TSAPs are usually written in hex (`0x0200`) but plain decimal is accepted too.
fn parse_tsap(key: &str, value: &str) -> Result<u16, ConfigError> {
    let trimmed = value.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_switch(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn is_switch(flag: &str) -> bool {
    matches!(flag, "--json-logs" | "--simulate" | "--help" | "-h")
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::load(&args, |key| std::env::var(key).ok())
    }

    /// Defaults, then `BATCH_*` variables from `env`, then command-line flags.
    pub fn load(
        args: &[String],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();
        for (var, flag) in ENV_FLAGS {
            if let Some(value) = env(var) {
                if is_switch(flag) {
                    if parse_switch(var, &value)? {
                        cfg.apply(flag, None)?;
                    }
                } else {
                    cfg.apply(flag, Some(&value))
                        .map_err(|e| rename_key(e, flag, var))?;
                }
            }
        }
        cfg.apply_args(args)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        Self::load(args, |_| None)
    }

    fn apply_args(&mut self, args: &[String]) -> Result<(), ConfigError> {
        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            if is_switch(flag) {
                self.apply(flag, None)?;
                if self.show_help {
                    break;
                }
            } else {
                self.apply(flag, args.get(i + 1).map(String::as_str))?;
                i += 1;
            }
            i += 1;
        }
        Ok(())
    }

    fn apply(&mut self, flag: &str, value: Option<&str>) -> Result<(), ConfigError> {
        let required = || value.ok_or_else(|| ConfigError::MissingValue(flag.to_string()));
        match flag {
            "--help" | "-h" => self.show_help = true,
            "--json-logs" => self.json_logs = true,
            "--simulate" => self.simulate = true,
            "--run-seconds" => self.run_seconds = Some(parse(flag, required()?)?),
            "--bind" => self.bind_addr = required()?.to_string(),
            "--log-dir" => self.log_dir = Some(PathBuf::from(required()?)),
            "--metrics-addr" => self.metrics_addr = Some(required()?.to_string()),
            "--audit-log" => self.audit_path = Some(PathBuf::from(required()?)),
            "--auth-secret" => self.auth_secret = Some(required()?.to_string()),
            "--auth-max-age" => self.auth_max_age_secs = parse(flag, required()?)?,
            "--protocol" => self.protocol = parse(flag, required()?)?,
            "--plc-host" => self.plc_host = required()?.to_string(),
            "--plc-port" => self.plc_port = Some(parse(flag, required()?)?),
            "--rack" => self.rack = parse(flag, required()?)?,
            "--slot" => self.slot = parse(flag, required()?)?,
            "--local-tsap" => self.local_tsap = Some(parse_tsap(flag, required()?)?),
            "--remote-tsap" => self.remote_tsap = Some(parse_tsap(flag, required()?)?),
            "--unit-id" => self.unit_id = parse(flag, required()?)?,
            "--poll-interval-ms" => self.poll_interval_ms = parse(flag, required()?)?,
            "--connect-timeout-ms" => self.connect_timeout_ms = parse(flag, required()?)?,
            "--io-timeout-ms" => self.io_timeout_ms = parse(flag, required()?)?,
            "--arido-max" => self.arido_max = parse(flag, required()?)?,
            "--pulse-ms" => self.pulse_ms = parse(flag, required()?)?,
            "--hold-timeout-ms" => self.hold_timeout_ms = parse(flag, required()?)?,
            "--map" => self.map_path = Some(PathBuf::from(required()?)),
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String, reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
            reason: reason.to_string(),
        };
        if self.poll_interval_ms == 0 {
            return Err(invalid("--poll-interval-ms", "0".into(), "must be positive"));
        }
        if !self.arido_max.is_finite() || self.arido_max <= 0.0 {
            return Err(invalid(
                "--arido-max",
                self.arido_max.to_string(),
                "must be a positive number",
            ));
        }
        if self.local_tsap.is_some() != self.remote_tsap.is_some() {
            return Err(invalid(
                "--remote-tsap",
                format!("{:?}", self.remote_tsap),
                "local and remote TSAP must be given together",
            ));
        }
        if matches!(&self.auth_secret, Some(secret) if secret.is_empty()) {
            return Err(invalid("--auth-secret", String::new(), "must not be empty"));
        }
        Ok(())
    }

    pub fn plc_port(&self) -> u16 {
        self.plc_port.unwrap_or(match self.protocol {
            Protocol::S7 => ISO_TCP_PORT,
            Protocol::Modbus => DEFAULT_MODBUS_PORT,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            limits: CommandLimits {
                set_point_max: self.arido_max,
                ..CommandLimits::default()
            },
            pulse_duration: Duration::from_millis(self.pulse_ms),
            hold_timeout: Duration::from_millis(self.hold_timeout_ms),
        }
    }

    pub fn print_help() {
        println!(
            r#"batch-bridge - PLC bridge for the concrete batching plant

USAGE:
    batch-bridge [OPTIONS]

PLC:
    --protocol <NAME>          s7 or modbus [default: s7]
    --plc-host <HOST>          PLC address [default: 127.0.0.1]
    --plc-port <PORT>          PLC port [default: 102 for s7, 502 for modbus]
    --rack <N>                 S7 rack, used to derive the remote TSAP [default: 0]
    --slot <N>                 S7 slot, used to derive the remote TSAP [default: 1]
    --local-tsap <TSAP>        Explicit local TSAP, e.g. 0x0100 (LOGO!)
    --remote-tsap <TSAP>       Explicit remote TSAP, e.g. 0x0200 (LOGO!)
    --unit-id <ID>             Modbus unit id [default: 1]
    --map <PATH>               JSON tag -> address mapping file (see addr-probe)
    --simulate                 Use the in-memory PLC instead of real hardware

TIMING AND LIMITS:
    --poll-interval-ms <MS>    Poll period [default: 1000]
    --connect-timeout-ms <MS>  Connect timeout [default: 2000]
    --io-timeout-ms <MS>       Read/write timeout [default: 2000]
    --arido-max <N>            Highest accepted ARIDO set-point [default: 100]
    --pulse-ms <MS>            INICIO/RESET pulse width [default: 100]
    --hold-timeout-ms <MS>     Force TARA off after this long [default: 5000]

SERVICE:
    --bind <ADDR>              HTTP/WebSocket bind address [default: 127.0.0.1:8080]
    --metrics-addr <ADDR>      Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>         Enable audit logging to specified JSONL file
    --auth-secret <STR>        Require HMAC tokens on commands
    --auth-max-age <SECS>      Maximum token age in seconds [default: 28800]
    --json-logs                Output logs in JSON format (for log aggregation)
    --log-dir <PATH>           Also write daily-rotated log files to this directory
    --run-seconds <SECS>       Run for a fixed duration then exit
    -h, --help                 Print this help message

ENVIRONMENT VARIABLES:
    Every option has a BATCH_* counterpart (BATCH_PLC_HOST, BATCH_POLL_INTERVAL_MS,
    BATCH_SIMULATE=1, ...). Command-line flags take precedence.
    RUST_LOG                   Set log filter (e.g., RUST_LOG=debug,batch_io=trace)

EXAMPLES:
    # LOGO! over ISO-on-TCP
    batch-bridge --plc-host 192.168.0.3 --local-tsap 0x0100 --remote-tsap 0x0200

    # Bench run without hardware
    batch-bridge --simulate --run-seconds 30 --metrics-addr 127.0.0.1:9090
"#
        );
    }
}

fn rename_key(err: ConfigError, flag: &str, var: &str) -> ConfigError {
    match err {
        ConfigError::InvalidValue { key, value, reason } if key == flag => {
            ConfigError::InvalidValue {
                key: var.to_string(),
                value,
                reason,
            }
        }
        other => other,
    }
}
