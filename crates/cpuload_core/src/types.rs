//! Definição de tipos para a publicação de carga de CPU.
//!
//! A mensagem é um objeto de valor montado a cada ciclo, serializado em
//! JSON e descartado logo após o publish.

use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────
// Mensagem
// ──────────────────────────────────────────────

/// Mensagem publicada no broker a cada heartbeat.
///
/// A ordem dos campos define a ordem das chaves no JSON:
/// `{"iid":…,"key":…,"time":…,"value":…}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Identificador da instância (host/processo)
    pub iid: String,
    /// Chave da métrica (ex.: "cpu")
    pub key: String,
    /// Timestamp formatado do início do ciclo
    pub time: String,
    /// Valor arredondado
    pub value: f64,
}

impl Message {
    pub fn new(
        iid: impl Into<String>,
        key: impl Into<String>,
        time: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            iid: iid.into(),
            key: key.into(),
            time: time.into(),
            value,
        }
    }
}

// ──────────────────────────────────────────────
// QoS
// ──────────────────────────────────────────────

/// Nível de QoS do MQTT, independente da biblioteca de rede.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QosLevel {
    /// 0 – no máximo uma vez
    AtMostOnce,
    /// 1 – pelo menos uma vez
    AtLeastOnce,
    /// 2 – exatamente uma vez
    ExactlyOnce,
}

impl QosLevel {
    /// Converte o inteiro configurado (0–2).
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

impl std::fmt::Display for QosLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.level())
    }
}

// ──────────────────────────────────────────────
// Arredondamento
// ──────────────────────────────────────────────

/// Arredonda `value` para `decimals` casas, metade para longe do zero.
///
/// `decimals` negativo arredonda para dezenas, centenas…
/// Precisões fora do alcance do `f64` devolvem `value` intacto.
pub fn round_value(value: f64, decimals: i32) -> f64 {
    let pow = 10f64.powi(decimals);
    if !pow.is_normal() {
        return value;
    }
    let rounded = (value * pow).round() / pow;
    if rounded.is_finite() { rounded } else { value }
}
