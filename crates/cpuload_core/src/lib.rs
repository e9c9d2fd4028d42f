//! # CPU Load Core
//!
//! Crate compartilhada que define a configuração via ambiente, a mensagem
//! publicada e o protocolo JSON do publicador de carga de CPU.
//!
//! ## Módulos
//! - [`types`] – Mensagem, nível de QoS e arredondamento
//! - [`protocol`] – Encode JSON e montagem de tópico
//! - [`config`] – Configuração imutável carregada do ambiente

pub mod types;
pub mod protocol;
pub mod config;

// Re-exports convenientes
pub use types::{Message, QosLevel, round_value};
pub use protocol::{encode_message, topic_for, ProtocolError};
pub use config::{AppConfig, ConfigError, Scheme};
