//! Backend selection module.
//!
//! This module defines the available computation backends and decides, per
//! call, which one executes an operation.
//!
//! # Supported Backends
//!
//! - `Gpu` — WGSL compute kernels dispatched through `wgpu` (feature `wgpu`).
//! - `CpuVector` — fused CPU kernels over raw buffers, parallelised with `rayon`.
//! - `Reference` — elementwise arithmetic, always available.
//!
//! Backends are tried in that priority order. Each accelerated backend is
//! described by a [`Probe`], which reports whether the hardware is usable and
//! whether a given call shape is supported. Selection is a pure function of a
//! [`Query`] and the probes; there is no process-wide state.
//!
//! # Configuration
//!
//! Toggles travel as an explicit [`BackendConfig`] value handed to every
//! operation at construction. [`BackendConfig::from_env`] builds one from the
//! `BRINY_BACKEND`, `BRINY_DISABLE_GPU` and `BRINY_DISABLE_VECMATH`
//! environment variables for callers that want that.

use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::tensors::{DType, Device};

/// Smallest epsilon accelerated batch-normalization kernels accept.
pub const ACCELERATED_MIN_EPS: f32 = 1e-5;

/// Enumeration of computation backends, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Backend {
    /// GPU-accelerated backend using `wgpu`.
    Gpu = 0,
    /// CPU vector-math kernels.
    CpuVector = 1,
    /// Plain elementwise arithmetic.
    Reference = 2,
}

impl Backend {
    /// All backends, highest priority first.
    pub const PRIORITY: [Backend; 3] = [Backend::Gpu, Backend::CpuVector, Backend::Reference];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::CpuVector => "cpu_vector",
            Self::Reference => "reference",
        }
    }

    /// Whether the backend is subject to the accelerated epsilon floor.
    pub const fn is_accelerated(self) -> bool {
        !matches!(self, Self::Reference)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Gpu),
            1 => Ok(Self::CpuVector),
            2 => Ok(Self::Reference),
            _ => Err(()),
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" | "wgpu" => Ok(Self::Gpu),
            "cpu" | "cpu_vector" | "vecmath" => Ok(Self::CpuVector),
            "reference" | "ref" => Ok(Self::Reference),
            other => Err(Error::config(format!("unknown backend `{other}`"))),
        }
    }
}

/// Kinds of work a backend may be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    BatchNormForward,
    BatchNormBackward,
    EmbedForward,
    EmbedBackward,
    ConvForward,
    ConvBackward,
}

/// Description of a single call, the input to [`BackendSelector::select`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Query {
    pub kind: OpKind,
    /// Rank of the primary input.
    pub rank: usize,
    /// Element type of the primary input.
    pub dtype: DType,
    /// Placement of the primary input.
    pub device: Device,
    /// Epsilon of a normalization call, `None` for other operations.
    pub eps: Option<f32>,
}

impl Query {
    pub fn new(kind: OpKind, rank: usize, dtype: DType, device: Device) -> Self {
        Self {
            kind,
            rank,
            dtype,
            device,
            eps: None,
        }
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = Some(eps);
        self
    }
}

/// Capability report of an accelerated backend.
///
/// Implementations must not fail: a backend that cannot initialise simply
/// reports `available() == false`.
pub trait Probe: Send + Sync {
    /// Backend this probe describes.
    fn backend(&self) -> Backend;

    /// Whether the hardware or library is usable in this process.
    fn available(&self) -> bool;

    /// Whether the backend implements `kind` for inputs of this rank and type.
    fn supports(&self, kind: OpKind, rank: usize, dtype: DType) -> bool;

    /// Placement the primary input must have, if any.
    fn required_device(&self) -> Option<Device> {
        None
    }

    /// Smallest normalization epsilon the backend accepts.
    fn min_eps(&self) -> f32 {
        0.0
    }
}

/// Explicit backend toggles, passed to operations at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendConfig {
    /// Allow the GPU backend.
    pub gpu: bool,
    /// Allow the CPU vector-math backend.
    pub cpu_vector: bool,
    /// Require one backend; selection fails instead of falling back.
    pub mandate: Option<Backend>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            gpu: true,
            cpu_vector: true,
            mandate: None,
        }
    }
}

impl BackendConfig {
    /// Only the reference backend.
    pub const fn reference_only() -> Self {
        Self {
            gpu: false,
            cpu_vector: false,
            mandate: None,
        }
    }

    /// Requires `backend` for every call.
    pub const fn mandated(backend: Backend) -> Self {
        Self {
            gpu: true,
            cpu_vector: true,
            mandate: Some(backend),
        }
    }

    /// Builds a configuration from the process environment.
    ///
    /// - `BRINY_BACKEND`: `gpu`, `cpu`/`cpu_vector` or `reference` mandates a backend.
    /// - `BRINY_DISABLE_GPU`, `BRINY_DISABLE_VECMATH`: any value other than
    ///   `0`/`false`/empty disables that backend.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let flag = |key: &str| {
            lookup(key).is_some_and(|v| {
                let v = v.trim();
                !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
            })
        };
        let mandate = match lookup("BRINY_BACKEND") {
            Some(v) if !v.trim().is_empty() => Some(v.parse::<Backend>()?),
            _ => None,
        };
        Ok(Self {
            gpu: !flag("BRINY_DISABLE_GPU"),
            cpu_vector: !flag("BRINY_DISABLE_VECMATH"),
            mandate,
        })
    }

    /// Whether the configuration permits `backend` at all.
    pub fn allows(&self, backend: Backend) -> bool {
        match backend {
            Backend::Gpu => self.gpu,
            Backend::CpuVector => self.cpu_vector,
            Backend::Reference => true,
        }
    }

    /// Whether `backend` was explicitly required.
    pub fn is_mandated(&self, backend: Backend) -> bool {
        self.mandate == Some(backend)
    }

    /// Fails when an accelerated backend is mandated with an epsilon below
    /// [`ACCELERATED_MIN_EPS`].
    pub fn check_eps(&self, eps: f32) -> Result<()> {
        match self.mandate {
            Some(b) if b.is_accelerated() && !(eps >= ACCELERATED_MIN_EPS) => {
                Err(Error::config(format!(
                    "eps {eps:e} is below the {ACCELERATED_MIN_EPS:e} floor of the mandated {b} backend"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Chooses a backend per call from a fixed set of probes.
#[derive(Clone)]
pub struct BackendSelector {
    config: BackendConfig,
    probes: Vec<Arc<dyn Probe>>,
}

impl fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSelector")
            .field("config", &self.config)
            .field(
                "probes",
                &self.probes.iter().map(|p| p.backend()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl BackendSelector {
    /// Selector over the probes compiled into this build.
    pub fn new(config: BackendConfig) -> Self {
        let mut probes: Vec<Arc<dyn Probe>> = Vec::with_capacity(2);
        #[cfg(feature = "wgpu")]
        probes.push(Arc::new(crate::ops::wgpu::GpuProbe::new(config.gpu)));
        probes.push(Arc::new(crate::ops::vecmath::VecMathProbe::new(config.cpu_vector)));
        Self { config, probes }
    }

    /// Selector over an explicit probe list, kept in priority order.
    pub fn with_probes(config: BackendConfig, mut probes: Vec<Arc<dyn Probe>>) -> Self {
        probes.sort_by_key(|p| p.backend() as u8);
        Self { config, probes }
    }

    pub fn config(&self) -> BackendConfig {
        self.config
    }

    /// Picks the backend for `query`.
    ///
    /// Without a mandate this never fails: the reference backend is the
    /// fallback. With a mandate the mandated backend is returned or an
    /// [`Error::Configuration`] explains why it cannot run the call.
    pub fn select(&self, query: &Query) -> Result<Backend> {
        if let Some(mandate) = self.config.mandate {
            if mandate == Backend::Reference {
                return Ok(Backend::Reference);
            }
            let probe = self
                .probes
                .iter()
                .find(|p| p.backend() == mandate)
                .ok_or_else(|| Error::config(format!("{mandate} backend is not compiled in")))?;
            return self
                .reject_reason(probe.as_ref(), query)
                .map_or(Ok(mandate), |reason| {
                    Err(Error::config(format!(
                        "mandated {mandate} backend cannot run {:?}: {reason}",
                        query.kind
                    )))
                });
        }

        for probe in &self.probes {
            match self.reject_reason(probe.as_ref(), query) {
                None => {
                    debug!(kind = ?query.kind, backend = %probe.backend(), "selected backend");
                    return Ok(probe.backend());
                }
                Some(reason) => {
                    debug!(kind = ?query.kind, backend = %probe.backend(), reason, "backend skipped");
                }
            }
        }
        debug!(kind = ?query.kind, backend = %Backend::Reference, "selected backend");
        Ok(Backend::Reference)
    }

    fn reject_reason(&self, probe: &dyn Probe, query: &Query) -> Option<&'static str> {
        if !self.config.allows(probe.backend()) {
            return Some("disabled by configuration");
        }
        if !probe.available() {
            return Some("unavailable");
        }
        if !probe.supports(query.kind, query.rank, query.dtype) {
            return Some("unsupported rank or dtype");
        }
        if probe.required_device().is_some_and(|d| d != query.device) {
            return Some("input not resident on the required device");
        }
        if let Some(eps) = query.eps {
            if !(eps >= probe.min_eps()) {
                return Some("eps below backend floor");
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProbe {
        backend: Backend,
        available: bool,
        device: Option<Device>,
    }

    impl Probe for FakeProbe {
        fn backend(&self) -> Backend {
            self.backend
        }

        fn available(&self) -> bool {
            self.available
        }

        fn supports(&self, kind: OpKind, rank: usize, dtype: DType) -> bool {
            kind == OpKind::BatchNormForward && matches!(rank, 2 | 4) && dtype == DType::F32
        }

        fn required_device(&self) -> Option<Device> {
            self.device
        }

        fn min_eps(&self) -> f32 {
            ACCELERATED_MIN_EPS
        }
    }

    fn selector(config: BackendConfig, gpu_available: bool) -> BackendSelector {
        BackendSelector::with_probes(
            config,
            vec![
                Arc::new(FakeProbe {
                    backend: Backend::CpuVector,
                    available: true,
                    device: None,
                }),
                Arc::new(FakeProbe {
                    backend: Backend::Gpu,
                    available: gpu_available,
                    device: Some(Device::Gpu),
                }),
            ],
        )
    }

    fn bn_query(rank: usize, device: Device, eps: f32) -> Query {
        Query::new(OpKind::BatchNormForward, rank, DType::F32, device).with_eps(eps)
    }

    #[test]
    fn prefers_gpu_for_resident_tensors() {
        let s = selector(BackendConfig::default(), true);
        assert_eq!(s.select(&bn_query(4, Device::Gpu, 2e-5)).unwrap(), Backend::Gpu);
        assert_eq!(s.select(&bn_query(4, Device::Host, 2e-5)).unwrap(), Backend::CpuVector);
    }

    #[test]
    fn falls_back_to_reference() {
        let s = selector(BackendConfig::default(), false);
        assert_eq!(s.select(&bn_query(3, Device::Gpu, 2e-5)).unwrap(), Backend::Reference);
        assert_eq!(s.select(&bn_query(2, Device::Host, 1e-6)).unwrap(), Backend::Reference);
        let q = Query::new(OpKind::EmbedForward, 1, DType::I32, Device::Host);
        assert_eq!(s.select(&q).unwrap(), Backend::Reference);
    }

    #[test]
    fn honours_toggles() {
        let config = BackendConfig {
            cpu_vector: false,
            ..BackendConfig::default()
        };
        let s = selector(config, true);
        assert_eq!(s.select(&bn_query(4, Device::Host, 2e-5)).unwrap(), Backend::Reference);
    }

    #[test]
    fn mandate_fails_instead_of_falling_back() {
        let s = selector(BackendConfig::mandated(Backend::CpuVector), true);
        assert_eq!(s.select(&bn_query(2, Device::Host, 2e-5)).unwrap(), Backend::CpuVector);
        let err = s.select(&bn_query(2, Device::Host, 1e-6)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let s = selector(BackendConfig::mandated(Backend::Gpu), false);
        assert!(s.select(&bn_query(4, Device::Gpu, 2e-5)).is_err());
    }

    #[test]
    fn mandated_eps_floor() {
        assert!(BackendConfig::mandated(Backend::Gpu).check_eps(1e-6).is_err());
        assert!(BackendConfig::mandated(Backend::Gpu).check_eps(1e-5).is_ok());
        assert!(BackendConfig::mandated(Backend::Reference).check_eps(1e-9).is_ok());
        assert!(BackendConfig::default().check_eps(1e-9).is_ok());
    }

    #[test]
    fn parses_environment() {
        let env = |pairs: &'static [(&'static str, &'static str)]| {
            move |key: &str| {
                pairs
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
            }
        };
        let c = BackendConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(c, BackendConfig::default());
        let c = BackendConfig::from_lookup(env(&[
            ("BRINY_BACKEND", "reference"),
            ("BRINY_DISABLE_GPU", "1"),
            ("BRINY_DISABLE_VECMATH", "false"),
        ]))
        .unwrap();
        assert_eq!(c.mandate, Some(Backend::Reference));
        assert!(!c.gpu);
        assert!(c.cpu_vector);
        assert!(BackendConfig::from_lookup(env(&[("BRINY_BACKEND", "tpu")])).is_err());
    }

    #[test]
    fn backend_round_trips_through_u8() {
        for b in Backend::PRIORITY {
            assert_eq!(Backend::try_from(b as u8), Ok(b));
        }
        assert!(Backend::try_from(7).is_err());
    }
}
