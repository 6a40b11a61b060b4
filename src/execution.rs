use crate::config::ProviderPreference;
use crate::error::{RagError, RagResult};
use once_cell::sync::OnceCell;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Provider selected for all inference sessions in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedProvider {
    Cpu,
    Cuda { device_id: i32 },
}

impl std::fmt::Display for SelectedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectedProvider::Cpu => write!(f, "CPU"),
            SelectedProvider::Cuda { device_id } => write!(f, "CUDA (device {})", device_id),
        }
    }
}

/// Outcome of the accelerator probe, memoized for the process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct ProviderStatus {
    pub provider: SelectedProvider,
    pub using_gpu: bool,
    pub fallback_to_cpu: bool,
}

static PROVIDER_STATUS: OnceCell<ProviderStatus> = OnceCell::new();
static PROBE_LOCK: Mutex<()> = Mutex::new(());

/// Resolve the execution provider once per process.
///
/// The probe asks the runtime whether the CUDA provider can be registered for
/// the configured device. Preference `gpu` with no accelerator is fatal before
/// any session is constructed; preference `cpu` on a machine that does have an
/// accelerator only logs a warning.
pub fn resolve_execution_provider(
    preference: ProviderPreference,
    device_id: i32,
) -> RagResult<ProviderStatus> {
    if let Some(status) = PROVIDER_STATUS.get() {
        return Ok(*status);
    }
    let _guard = PROBE_LOCK.lock();
    if let Some(status) = PROVIDER_STATUS.get() {
        return Ok(*status);
    }

    let available = cuda_available(device_id);
    let status = map_preference(preference, available, device_id)?;

    info!(provider = %status.provider, fallback = status.fallback_to_cpu, "Execution provider resolved");
    let _ = PROVIDER_STATUS.set(status);
    Ok(status)
}

/// Pure mapping from `(preference, availability)` to the selected provider.
pub fn map_preference(
    preference: ProviderPreference,
    available: bool,
    device_id: i32,
) -> RagResult<ProviderStatus> {
    match (preference, available) {
        (ProviderPreference::Gpu, false) => Err(RagError::AcceleratorUnavailable(
            "execution_provider_preference = \"gpu\" but no CUDA device is usable; \
             install the CUDA runtime or switch the preference to \"auto\""
                .into(),
        )),
        (ProviderPreference::Gpu, true) | (ProviderPreference::Auto, true) => Ok(ProviderStatus {
            provider: SelectedProvider::Cuda { device_id },
            using_gpu: true,
            fallback_to_cpu: false,
        }),
        (ProviderPreference::Auto, false) => Ok(ProviderStatus {
            provider: SelectedProvider::Cpu,
            using_gpu: false,
            fallback_to_cpu: true,
        }),
        (ProviderPreference::Cpu, available) => {
            if available {
                warn!("CUDA device available but execution_provider_preference = \"cpu\"");
            }
            Ok(ProviderStatus {
                provider: SelectedProvider::Cpu,
                using_gpu: false,
                fallback_to_cpu: false,
            })
        }
    }
}

fn cuda_available(device_id: i32) -> bool {
    use ort::ep::{ExecutionProvider, CUDA};
    CUDA::default()
        .with_device_id(device_id)
        .is_available()
        .unwrap_or(false)
}

/// Build an inference session against a resolved provider.
/// A missing model file is a resource error, not an inference error.
pub fn build_session(model_path: &Path, status: ProviderStatus) -> RagResult<Session> {
    use ort::ep::CUDA;

    if !model_path.exists() {
        return Err(RagError::Resource(format!(
            "model file not found: {} (download the ONNX model or fix the configured path)",
            model_path.display()
        )));
    }

    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(ort::Error::<()>::from)?
        .with_intra_threads(4)
        .map_err(ort::Error::<()>::from)?;

    let session = match status.provider {
        SelectedProvider::Cuda { device_id } => builder
            .with_execution_providers([CUDA::default().with_device_id(device_id).build()])
            .map_err(ort::Error::<()>::from)?
            .commit_from_file(model_path)?,
        SelectedProvider::Cpu => builder.commit_from_file(model_path)?,
    };
    Ok(session)
}

/// Exponential backoff schedule: `base * factor^n` after the n-th failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub attempts: u32,
}

/// Internal work: transient I/O, inference batches.
pub const INTERNAL_RETRY: RetryPolicy = RetryPolicy {
    base: Duration::from_millis(200),
    factor: 2,
    attempts: 3,
};

/// HTTP-shaped calls to the LLM collaborator.
pub const REMOTE_RETRY: RetryPolicy = RetryPolicy {
    base: Duration::from_secs(1),
    factor: 2,
    attempts: 3,
};

impl RetryPolicy {
    fn delay_after(&self, failed_attempts: u32) -> Duration {
        self.base * self.factor.saturating_pow(failed_attempts.saturating_sub(1))
    }
}

/// Retry an async operation under a policy. Only transient errors retry.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> RagResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RagResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                let delay = policy.delay_after(attempt);
                warn!(%label, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Blocking-context counterpart, for work already running on a pool worker.
pub fn retry_blocking<T, F>(policy: RetryPolicy, label: &str, mut op: F) -> RagResult<T>
where
    F: FnMut() -> RagResult<T>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                let delay = policy.delay_after(attempt);
                warn!(%label, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after transient failure");
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
