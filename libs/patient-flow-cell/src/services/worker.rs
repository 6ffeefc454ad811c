use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::FlowError;
use crate::services::PatientFlowEngine;

/// Counts from one pass of both sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub late: usize,
    pub no_show: usize,
}

/// Periodically flags late arrivals and marks no-shows.
pub struct SweepWorker {
    engine: Arc<PatientFlowEngine>,
    period: Duration,
}

impl SweepWorker {
    pub fn new(engine: Arc<PatientFlowEngine>, period: Duration) -> Self {
        Self { engine, period }
    }

    /// Late flags first, so an appointment crossing both thresholds in one
    /// pass is flagged before it leaves the flow.
    pub async fn run_once(&self) -> Result<SweepReport, FlowError> {
        let late = self.engine.mark_late().await?;
        let no_show = self.engine.mark_no_show().await?;
        Ok(SweepReport { late, no_show })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Sweep worker started, every {:?}", self.period);
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(report) => debug!(
                        "Sweep pass complete - late: {}, no-show: {}",
                        report.late, report.no_show
                    ),
                    Err(e) => error!("Sweep pass failed: {}", e),
                }
            }
        })
    }
}
