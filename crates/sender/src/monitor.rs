//! Monitor de CPU – amostragem de uso médio em janela fixa.
//!
//! O uso de CPU vem do `sysinfo`: dois refreshes separados pela janela de
//! medição, e o uso global é a média entre eles.

use async_trait::async_trait;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tracing::debug;

/// Janela de medição de cada amostra.
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Erros de amostragem. Não são fatais: o ciclo é pulado.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("Nenhuma CPU detectada")]
    NoCpus,

    #[error("Leitura de CPU inválida: {0}")]
    InvalidReading(f32),
}

/// Fonte de leituras de uso de CPU (0–100%).
#[async_trait]
pub trait CpuSampler: Send {
    /// Mede o uso médio de CPU; bloqueia a task por toda a janela.
    async fn sample(&mut self) -> Result<f64, SampleError>;
}

/// Amostrador baseado em `sysinfo`.
pub struct SysinfoSampler {
    sys: System,
    window: Duration,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self::with_window(SAMPLE_WINDOW)
    }

    /// Janela customizada; valores abaixo do mínimo do `sysinfo` são elevados.
    pub fn with_window(window: Duration) -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_cpu_usage()),
        );
        Self {
            sys,
            window: window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }
}

#[async_trait]
impl CpuSampler for SysinfoSampler {
    async fn sample(&mut self) -> Result<f64, SampleError> {
        self.sys.refresh_cpu_usage();
        tokio::time::sleep(self.window).await;
        self.sys.refresh_cpu_usage();

        if self.sys.cpus().is_empty() {
            return Err(SampleError::NoCpus);
        }

        let usage = self.sys.global_cpu_usage();
        if !usage.is_finite() {
            return Err(SampleError::InvalidReading(usage));
        }

        debug!("CPU {:.2}% ({} cores)", usage, self.sys.cpus().len());
        Ok(f64::from(usage))
    }
}
