//! The pluggable probes the [`Detector`] drives.
//!
//! Probes are external code: a STUN client, a UPnP implementation, a plugin living in
//! another process.  The detector makes no assumption about how long they take or whether
//! they behave, it only promises never to run two detections of the same probe at once.
//!
//! [`Detector`]: crate::Detector

use std::sync::Arc;

use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use snafu::{IntoError, Snafu};

use crate::{
    nat::RawReading,
    port_forward::{PortSet, StatusSink},
};

/// Identity of a registered probe.
///
/// Two handles refer to the same probe if they point to the same allocation, registering
/// a clone of an [`Arc`] is registering the same probe again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("probe-{_0:x}")]
pub struct ProbeId(pub(crate) usize);

impl ProbeId {
    /// Returns the identity of the probe behind `probe`.
    pub fn of<T: ?Sized>(probe: &Arc<T>) -> Self {
        Self(Arc::as_ptr(probe) as *const () as usize)
    }
}

/// A probe detecting the node's external address and NAT type.
pub trait IpDetector: std::fmt::Debug + Send + Sync + 'static {
    /// A name for logging.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Runs one detection.
    ///
    /// This may take arbitrarily long, there is no timeout imposed by the caller.  An empty
    /// result, an error or a panic all count as a failed detection.
    fn detect(&self) -> BoxFuture<Result<Vec<RawReading>, ProbeError>>;
}

impl<T: IpDetector> IpDetector for Arc<T> {
    fn name(&self) -> &str {
        self.as_ref().name()
    }

    fn detect(&self) -> BoxFuture<Result<Vec<RawReading>, ProbeError>> {
        self.as_ref().detect()
    }
}

/// A probe trying to forward the node's ports on the local router.
pub trait PortForwarder: std::fmt::Debug + Send + Sync + 'static {
    /// A name for logging.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Asks for `ports` to be forwarded, replacing any previous set.
    ///
    /// Results may be reported through `status` at any time, also after the returned future
    /// completed.  The returned future should complete once the request was handed off.
    fn forward(&self, ports: PortSet, status: StatusSink) -> BoxFuture<Result<(), ProbeError>>;
}

/// Whoever runs the probes, e.g. a plugin manager.
pub trait ProbeHost: std::fmt::Debug + Send + Sync + 'static {
    /// Best-effort termination of an in-flight detection of an unregistered probe.
    fn terminate(&self, probe: &Arc<dyn IpDetector>);
}

/// A [`ProbeHost`] which cannot terminate anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl ProbeHost for NoopHost {
    fn terminate(&self, _probe: &Arc<dyn IpDetector>) {}
}

/// Probe errors
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ProbeError {
    #[snafu(display("Probe '{provenance}' error"))]
    User {
        provenance: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[snafu(display("Probe task panicked"))]
    Panicked { source: n0_future::task::JoinError },
}

impl ProbeError {
    /// Creates a new user error from an arbitrary error type.
    pub fn from_err<T: std::error::Error + Send + Sync + 'static>(
        provenance: &'static str,
        source: T,
    ) -> Self {
        UserSnafu { provenance }.into_error(Box::new(source))
    }

    /// Creates a new user error from an arbitrary boxed error type.
    pub fn from_err_box(
        provenance: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    ) -> Self {
        UserSnafu { provenance }.into_error(source)
    }

    pub(crate) fn panicked(source: n0_future::task::JoinError) -> Self {
        PanickedSnafu.into_error(source)
    }
}
