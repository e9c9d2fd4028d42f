//! Configuração via variáveis de ambiente.
//!
//! Todas as variáveis são obrigatórias e lidas uma única vez na
//! inicialização. O resultado é um [`AppConfig`] imutável, passado
//! explicitamente para quem precisa dele.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::protocol::topic_for;
use crate::types::QosLevel;

pub const MQTT_BROKER: &str = "MQTT_BROKER";
pub const MQTT_PORT: &str = "MQTT_PORT";
pub const MQTT_PROTOCOL: &str = "MQTT_PROTOCOL";
pub const MQTT_TLS_INSECURE_SKIP_VERIFY: &str = "MQTT_TLS_INSECURE_SKIP_VERIFY";
pub const MQTT_CLIENT_ID: &str = "MQTT_CLIENT_ID";
pub const MQTT_USERNAME: &str = "MQTT_USERNAME";
pub const MQTT_PASSWORD: &str = "MQTT_PASSWORD";
pub const MQTT_TOPIC: &str = "MQTT_TOPIC";
pub const MQTT_TIME_FORMAT: &str = "MQTT_TIME_FORMAT";
pub const MQTT_IID: &str = "MQTT_IID";
pub const MQTT_KEY: &str = "MQTT_KEY";
pub const MQTT_VALUE_ROUND: &str = "MQTT_VALUE_ROUND";
pub const MQTT_QOS: &str = "MQTT_QOS";
pub const MQTT_RETAIN: &str = "MQTT_RETAIN";
pub const HEARTBEAT_INTERVAL: &str = "HEARTBEAT_INTERVAL";
/// Opcional: caminho do bundle de CA.
pub const MQTT_CA_FILE: &str = "MQTT_CA_FILE";

/// Bundle de CA padrão, relativo ao diretório de trabalho.
pub const DEFAULT_CA_FILE: &str = "ca_3.pem";

/// Erros de configuração. Todos são fatais na inicialização.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Variável de ambiente ausente: {0}")]
    Missing(&'static str),

    #[error("{var}: inteiro inválido {value:?} ({reason})")]
    InvalidInteger {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var}: booleano inválido {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("{MQTT_QOS}: QoS inválido {0} (esperado 0, 1 ou 2)")]
    InvalidQos(i64),

    #[error("{MQTT_TIME_FORMAT}: formato de tempo inválido {0:?}")]
    InvalidTimeFormat(String),

    #[error(
        "{MQTT_PROTOCOL}: protocolo não suportado {0:?} (use ssl, tls, mqtts, tcps, tcp, mqtt, ws ou wss)"
    )]
    UnsupportedProtocol(String),
}

/// Transporte derivado de `MQTT_PROTOCOL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// TCP com TLS (`ssl`, `tls`, `mqtts`, `tcps`)
    Tls,
    /// TCP puro (`tcp`, `mqtt`)
    Tcp,
    /// WebSocket (`ws`)
    Ws,
    /// WebSocket sobre TLS (`wss`)
    Wss,
}

impl Scheme {
    pub fn parse(protocol: &str) -> Result<Self, ConfigError> {
        match protocol.to_ascii_lowercase().as_str() {
            "ssl" | "tls" | "mqtts" | "tcps" => Ok(Self::Tls),
            "tcp" | "mqtt" => Ok(Self::Tcp),
            "ws" => Ok(Self::Ws),
            "wss" => Ok(Self::Wss),
            _ => Err(ConfigError::UnsupportedProtocol(protocol.to_string())),
        }
    }
}

/// Configuração raiz do processo.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Host do broker
    pub broker: String,
    /// Porta do broker
    pub port: u16,
    /// Esquema como configurado (usado na URL e nos logs)
    pub protocol: String,
    pub scheme: Scheme,
    /// Aceita qualquer certificado do servidor (apenas para testes)
    pub tls_insecure_skip_verify: bool,
    /// Prefixo do client id; o timestamp de conexão é concatenado
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// Tópico base
    pub topic: String,
    /// Formato strftime dos timestamps
    pub time_format: String,
    /// Identificador da instância
    pub iid: String,
    /// Chave da métrica
    pub key: String,
    /// Casas decimais do valor publicado
    pub value_round: i32,
    pub qos: QosLevel,
    pub retain: bool,
    /// Período alvo entre publicações
    pub heartbeat_interval: Duration,
    /// Bundle de CA confiável
    pub ca_file: PathBuf,
}

impl AppConfig {
    /// Carrega a configuração do ambiente do processo.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|name| std::env::var(name).ok())?;
        info!("Configuração carregada do ambiente");
        Ok(config)
    }

    /// Carrega a configuração a partir de uma função de busca arbitrária.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let broker = required(MQTT_BROKER)?;
        let port = parse_int::<u16>(MQTT_PORT, &required(MQTT_PORT)?)?;
        let protocol = required(MQTT_PROTOCOL)?;
        let scheme = Scheme::parse(&protocol)?;
        let tls_insecure_skip_verify = parse_bool(
            MQTT_TLS_INSECURE_SKIP_VERIFY,
            &required(MQTT_TLS_INSECURE_SKIP_VERIFY)?,
        )?;
        let client_id = required(MQTT_CLIENT_ID)?;
        let username = required(MQTT_USERNAME)?;
        let password = required(MQTT_PASSWORD)?;
        let topic = required(MQTT_TOPIC)?;

        let time_format = required(MQTT_TIME_FORMAT)?;
        validate_time_format(&time_format)?;

        let iid = required(MQTT_IID)?;
        let key = required(MQTT_KEY)?;
        let value_round = parse_int::<i32>(MQTT_VALUE_ROUND, &required(MQTT_VALUE_ROUND)?)?;

        let qos_raw = parse_int::<i64>(MQTT_QOS, &required(MQTT_QOS)?)?;
        let qos = u8::try_from(qos_raw)
            .ok()
            .and_then(QosLevel::from_level)
            .ok_or(ConfigError::InvalidQos(qos_raw))?;

        let retain = parse_bool(MQTT_RETAIN, &required(MQTT_RETAIN)?)?;
        let interval_ms = parse_int::<u64>(HEARTBEAT_INTERVAL, &required(HEARTBEAT_INTERVAL)?)?;

        let ca_file = lookup(MQTT_CA_FILE)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_CA_FILE.to_string());

        Ok(Self {
            broker,
            port,
            protocol,
            scheme,
            tls_insecure_skip_verify,
            client_id,
            username,
            password,
            topic,
            time_format,
            iid,
            key,
            value_round,
            qos,
            retain,
            heartbeat_interval: Duration::from_millis(interval_ms),
            ca_file: PathBuf::from(ca_file),
        })
    }

    /// URL do broker no formato `protocol://host:port`.
    pub fn broker_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.broker, self.port)
    }

    /// Tópico de publicação `{topic}/{iid}/{key}`.
    pub fn publish_topic(&self) -> String {
        topic_for(&self.topic, &self.iid, &self.key)
    }

    /// Formata um instante com o formato configurado.
    pub fn format_time<Tz>(&self, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        at.format(&self.time_format).to_string()
    }

    /// Client id: prefixo configurado + timestamp, para evitar colisão entre reinícios.
    pub fn client_id_at<Tz>(&self, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        format!("{}{}", self.client_id, self.format_time(at))
    }
}

fn parse_int<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: Display,
{
    value
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidInteger {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Aceita as grafias clássicas: `1 t T TRUE true True 0 f F FALSE false False`.
pub fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

/// Rejeita formatos com especificadores inválidos, que fariam a formatação falhar depois.
fn validate_time_format(format: &str) -> Result<(), ConfigError> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::InvalidTimeFormat(format.to_string()));
    }
    Ok(())
}
