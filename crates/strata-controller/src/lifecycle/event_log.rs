use log::info;

use crate::lifecycle::Joblet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Started,
    Completed,
    Failed,
    Aborted,
}

impl JobEvent {
    pub fn status(&self) -> &'static str {
        match self {
            JobEvent::Started => "JOB_STARTED",
            JobEvent::Completed => "JOB_COMPLETED",
            JobEvent::Failed => "JOB_FAILED",
            JobEvent::Aborted => "JOB_ABORTED",
        }
    }
}

/// Writes structured job events as `key=value` log lines.
#[derive(Debug, Default)]
pub struct JobEventLog {
    event_count: usize,
}

impl JobEventLog {
    pub fn record(&mut self, event: JobEvent, joblet: &Joblet, detail: Option<&str>) {
        self.event_count += 1;
        let duration_ms = joblet
            .start_time
            .zip(joblet.finish_time)
            .map(|(start, finish)| (finish - start).num_milliseconds())
            .unwrap_or(0);
        info!(
            "event={} job_id={} job_type={} task={} node={} state={} duration_ms={duration_ms} detail={}",
            event.status(),
            joblet.job_id,
            joblet.job_type,
            joblet.task,
            joblet.node.address,
            joblet.state.status(),
            detail.unwrap_or("-")
        );
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }
}
