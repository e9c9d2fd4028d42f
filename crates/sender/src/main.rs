//! # CPU Load Sender
//!
//! Mede o uso de CPU do host e publica em JSON num broker MQTT via TLS,
//! a cada heartbeat.
//!
//! ## Uso
//! ```bash
//! cpuload_sender                  # lê o ambiente (e um .env local, se existir)
//! RUST_LOG=debug cpuload_sender   # log detalhado
//! ```
//!
//! Requer `ca_3.pem` no diretório de trabalho (ou `MQTT_CA_FILE`).

mod monitor;
mod mqtt;
mod publish_loop;
mod tls;

use cpuload_core::config::AppConfig;
use monitor::SysinfoSampler;
use mqtt::{LoggingHooks, MqttSession};
use publish_loop::{LoopExit, run_publish_loop};
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    // ── .env (antes do logging, para valer RUST_LOG do arquivo) ──
    let dotenv = dotenvy::dotenv();

    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match dotenv {
        Ok(path) => info!("Variáveis carregadas de {}", path.display()),
        Err(e) if e.not_found() => debug!("Sem arquivo .env, usando apenas o ambiente"),
        Err(e) => {
            error!("Erro ao carregar arquivo .env: {e}");
            process::exit(1);
        }
    }

    // ── Carregar config ──
    let config = Arc::new(AppConfig::from_env().unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    }));

    // ── TLS (antes de qualquer conexão) ──
    let tls = tls::build_tls_config(&config.ca_file, config.tls_insecure_skip_verify)
        .unwrap_or_else(|e| {
            error!("{e}");
            process::exit(1);
        });

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   ⚡ CPU LOAD SENDER – MQTT");
    println!("══════════════════════════════════════════════");
    println!("  Broker:    {}", config.broker_url());
    println!("  Tópico:    {}", config.publish_topic());
    println!("  Intervalo: {} ms", config.heartbeat_interval.as_millis());
    println!("  QoS:       {} (retain: {})", config.qos, config.retain);
    println!("══════════════════════════════════════════════");
    println!();

    // ── Conexão ──
    info!("Conectando a {}", config.broker_url());
    let session = match MqttSession::connect(&config, tls, Arc::new(LoggingHooks)).await {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!("Falha ao conectar ao broker: {e}");
            process::exit(1);
        }
    };
    info!("Conectado ao broker MQTT");

    // ── Loop de publicação ──
    let cancel = CancellationToken::new();
    let publisher = {
        let session = Arc::clone(&session);
        let config = Arc::clone(&config);
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut sampler = SysinfoSampler::new();
            match run_publish_loop(session.as_ref(), &mut sampler, &config, &cancel).await {
                LoopExit::Disconnected => {
                    warn!("Publicação interrompida; processo ocioso até ser finalizado")
                }
                LoopExit::Cancelled => debug!("Loop de publicação cancelado"),
            }
        })
    };

    // ── Espera sinal de encerramento ──
    shutdown_signal().await;
    cancel.cancel();

    if let Err(e) = publisher.await {
        warn!("Loop de publicação terminou com erro: {e}");
    }
    session.disconnect().await;
    info!("Encerrado");
}

/// Espera Ctrl+C ou SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Falha ao escutar Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Falha ao escutar SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C recebido, encerrando..."),
        _ = terminate => info!("SIGTERM recebido, encerrando..."),
    }
}
