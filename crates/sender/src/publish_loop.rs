//! Loop de publicação – amostra, formata, publica e dorme até o próximo heartbeat.
//!
//! O período é autocorrigido: o tempo gasto medindo e publicando é
//! descontado do intervalo. Se um ciclo estoura o intervalo, o próximo
//! começa imediatamente, sem tentar recuperar ciclos perdidos.

use chrono::Local;
use cpuload_core::config::AppConfig;
use cpuload_core::protocol::encode_message;
use cpuload_core::types::{Message, round_value};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::monitor::CpuSampler;
use crate::mqtt::{Broker, PublishError};

/// Formato do timestamp nas linhas de log de publicação.
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";

/// Motivo do fim do loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// O broker estava desconectado antes de um publish
    Disconnected,
    /// Encerramento solicitado
    Cancelled,
}

/// Como um publish é reportado no log.
#[derive(Debug)]
pub enum PublishOutcome {
    Published,
    /// Erro com a conexão ainda ativa: conta como publicado
    PublishedWithError(PublishError),
    /// Erro e conexão caída
    Failed(PublishError),
}

impl PublishOutcome {
    /// Classifica o resultado do publish pelo estado da conexão logo após.
    pub fn classify(result: Result<(), PublishError>, connected: bool) -> Self {
        match result {
            Ok(()) => Self::Published,
            Err(e) if connected => Self::PublishedWithError(e),
            Err(e) => Self::Failed(e),
        }
    }
}

/// Tempo a dormir para fechar o intervalo; `None` se o ciclo já estourou.
pub fn remaining_sleep(interval: Duration, elapsed: Duration) -> Option<Duration> {
    interval.checked_sub(elapsed).filter(|rest| !rest.is_zero())
}

/// Executa o loop até a conexão cair ou o token ser cancelado.
pub async fn run_publish_loop<B, S>(
    broker: &B,
    sampler: &mut S,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> LoopExit
where
    B: Broker + ?Sized,
    S: CpuSampler + ?Sized,
{
    let topic = config.publish_topic();
    let broker_url = config.broker_url();
    info!(
        "Loop de publicação iniciado → {topic} a cada {:?}",
        config.heartbeat_interval
    );

    loop {
        let cycle_start = Instant::now();
        let started_at = Local::now();

        let sampled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return LoopExit::Cancelled,
            result = sampler.sample() => result,
        };

        let load = match sampled {
            Ok(usage) => round_value(usage, config.value_round),
            Err(e) => {
                error!("Erro ao obter carga de CPU: {e}");
                continue;
            }
        };

        let message = Message::new(
            config.iid.as_str(),
            config.key.as_str(),
            config.format_time(&started_at),
            load,
        );
        let payload = match encode_message(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Erro ao serializar JSON: {e}");
                continue;
            }
        };

        if !broker.is_connected() {
            error!("Cliente MQTT não está conectado, encerrando publicação");
            return LoopExit::Disconnected;
        }

        let result = broker.publish(&topic, config.qos, config.retain, payload).await;
        match PublishOutcome::classify(result, broker.is_connected()) {
            PublishOutcome::Failed(e) => {
                error!("Erro ao publicar mensagem: {e}");
            }
            outcome => {
                if let PublishOutcome::PublishedWithError(e) = outcome {
                    debug!("Publish reportou erro com a conexão ativa: {e}");
                }
                info!(
                    "Carga de CPU publicada: {load} em {} para {broker_url}",
                    started_at.format(LOG_TIME_FORMAT)
                );
            }
        }

        if let Some(rest) = remaining_sleep(config.heartbeat_interval, cycle_start.elapsed()) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                _ = tokio::time::sleep(rest) => {}
            }
        }
    }
}
