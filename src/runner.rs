//! Runs one detection probe and folds its result into the detector's state.

use std::sync::Arc;

use n0_future::{task, time::Instant};
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::{
    alerts::{AlertInfo, AlertTier},
    classify::{ConnectivityVerdict, aggregate},
    detector::Inner,
    nat::RawReading,
    probe::{IpDetector, ProbeError, ProbeId},
};

/// One detection of one probe.
#[derive(Debug)]
pub(crate) struct Runner {
    pub(crate) id: ProbeId,
    pub(crate) generation: u64,
    pub(crate) probe: Arc<dyn IpDetector>,
}

/// What to tell the collaborators once the state is updated.
#[derive(Debug)]
struct Published {
    readings: Vec<RawReading>,
    verdict: ConnectivityVerdict,
    /// The NAT tier to clear and the one to raise.
    alerts: Option<(Option<AlertTier>, Option<AlertTier>)>,
    clear_no_data: bool,
}

impl Runner {
    /// Runs the probe in its own task.
    ///
    /// Once done the result is recorded and a new evaluation is requested.
    pub(crate) fn spawn(self, inner: Arc<Inner>) {
        let span = debug_span!("runner", probe = %self.probe.name());
        task::spawn(
            async move {
                let probe = self.probe.clone();
                // The inner task catches panics from the probe.
                let res = task::spawn(async move { probe.detect().await })
                    .await
                    .unwrap_or_else(|err| Err(ProbeError::panicked(err)));
                self.finish(&inner, res);
                inner.trigger.request();
            }
            .instrument(span),
        );
    }

    fn finish(&self, inner: &Inner, res: Result<Vec<RawReading>, ProbeError>) {
        let readings = match res {
            Ok(readings) => readings,
            Err(err) => {
                warn!("detection failed: {err:#}");
                inner.metrics.probe_faults.inc();
                Vec::new()
            }
        };
        let valid: Vec<_> = readings.into_iter().filter(RawReading::is_valid).collect();

        let published = {
            let mut state = inner.state.lock();
            if !state.is_current(self.id, self.generation) {
                debug!("probe was unregistered meanwhile, discarding result");
                inner.metrics.stale_results.inc();
                return;
            }
            state.active.remove(&self.id);
            state.last_round_end = Some(Instant::now());
            state.completed.insert(self.id);

            if valid.is_empty() {
                debug!("no valid readings");
                inner.metrics.rounds_failed.inc();
                state.failed.insert(self.id);
                None
            } else {
                inner.metrics.rounds_succeeded.inc();
                state.readings.extend(valid.iter().cloned());
                let verdict = ConnectivityVerdict::from_class(aggregate(&state.readings));
                let previous = std::mem::replace(&mut state.verdict, verdict);
                let tier = verdict.alert_tier();
                let alerts = (state.raised != tier).then(|| {
                    let old = std::mem::replace(&mut state.raised, tier);
                    (old, tier)
                });
                if previous != verdict {
                    info!(%previous, %verdict, "connectivity changed");
                }
                Some(Published {
                    readings: valid,
                    verdict,
                    alerts,
                    clear_no_data: std::mem::take(&mut state.no_data_raised),
                })
            }
        };

        let Some(published) = published else {
            inner.addresses.on_detection_settled();
            return;
        };
        debug!(verdict = %published.verdict, readings = published.readings.len(), "detection succeeded");
        if published.clear_no_data {
            inner.alerts.clear(AlertTier::NoDetectionData);
        }
        if let Some((old, new)) = published.alerts {
            if let Some(old) = old {
                inner.alerts.clear(old);
            }
            if let Some(new) = new {
                inner.alerts.raise(new, AlertInfo::new(new, &inner.notifier.ports()));
            }
        }
        inner.addresses.on_readings(&published.readings);
        inner.addresses.on_detection_settled();
    }
}
