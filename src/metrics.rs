use crate::flow::FlowStatus;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,

    // Flow metrics
    pub flows_admitted: IntCounter,
    pub flows_finished: IntCounterVec,
    pub active_flows: IntGauge,
    pub duplicate_events: IntCounter,
    pub simulated_losses: IntCounter,

    // Breakpoint metrics
    pub breakpoints_opened: IntCounter,
    pub breakpoints_expired: IntCounter,
    pub pending_breakpoints: IntGauge,
    pub breakpoint_hold_duration: Histogram,

    // Subscriber metrics
    pub subscribers: IntGauge,
    pub subscriber_overflows: IntCounter,

    // Session metrics
    pub session_starts: IntCounter,
    pub adapter_errors: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let flows_admitted =
            IntCounter::new("flowctl_flows_admitted_total", "Total number of flows admitted")
                .expect("metric creation failed");
        let flows_finished = IntCounterVec::new(
            Opts::new("flowctl_flows_finished_total", "Finished flows by terminal status"),
            &["status"],
        )
        .expect("metric creation failed");
        let active_flows = IntGauge::new("flowctl_active_flows", "Number of non-terminal flows")
            .expect("metric creation failed");
        let duplicate_events = IntCounter::new(
            "flowctl_duplicate_events_total",
            "Adapter events discarded as benign duplicates",
        )
        .expect("metric creation failed");
        let simulated_losses = IntCounter::new(
            "flowctl_simulated_losses_total",
            "Flows errored by simulated packet loss",
        )
        .expect("metric creation failed");

        let breakpoints_opened = IntCounter::new(
            "flowctl_breakpoints_opened_total",
            "Total number of breakpoints that held a flow",
        )
        .expect("metric creation failed");
        let breakpoints_expired = IntCounter::new(
            "flowctl_breakpoints_expired_total",
            "Breakpoints resolved by timeout policy",
        )
        .expect("metric creation failed");
        let pending_breakpoints = IntGauge::new(
            "flowctl_pending_breakpoints",
            "Flows currently held at a breakpoint",
        )
        .expect("metric creation failed");
        let breakpoint_hold_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "flowctl_breakpoint_hold_seconds",
            "Time flows spent held at a breakpoint",
        ))
        .expect("metric creation failed");

        let subscribers = IntGauge::new("flowctl_subscribers", "Connected event subscribers")
            .expect("metric creation failed");
        let subscriber_overflows = IntCounter::new(
            "flowctl_subscriber_overflows_total",
            "Subscribers disconnected for falling behind",
        )
        .expect("metric creation failed");

        let session_starts =
            IntCounter::new("flowctl_session_starts_total", "Successful session starts")
                .expect("metric creation failed");
        let adapter_errors =
            IntCounter::new("flowctl_adapter_errors_total", "Errors reported by the engine")
                .expect("metric creation failed");

        registry.register(Box::new(flows_admitted.clone())).unwrap();
        registry.register(Box::new(flows_finished.clone())).unwrap();
        registry.register(Box::new(active_flows.clone())).unwrap();
        registry
            .register(Box::new(duplicate_events.clone()))
            .unwrap();
        registry
            .register(Box::new(simulated_losses.clone()))
            .unwrap();
        registry
            .register(Box::new(breakpoints_opened.clone()))
            .unwrap();
        registry
            .register(Box::new(breakpoints_expired.clone()))
            .unwrap();
        registry
            .register(Box::new(pending_breakpoints.clone()))
            .unwrap();
        registry
            .register(Box::new(breakpoint_hold_duration.clone()))
            .unwrap();
        registry.register(Box::new(subscribers.clone())).unwrap();
        registry
            .register(Box::new(subscriber_overflows.clone()))
            .unwrap();
        registry.register(Box::new(session_starts.clone())).unwrap();
        registry.register(Box::new(adapter_errors.clone())).unwrap();

        Self {
            registry,
            flows_admitted,
            flows_finished,
            active_flows,
            duplicate_events,
            simulated_losses,
            breakpoints_opened,
            breakpoints_expired,
            pending_breakpoints,
            breakpoint_hold_duration,
            subscribers,
            subscriber_overflows,
            session_starts,
            adapter_errors,
        }
    }

    pub fn record_flow_admitted(&self) {
        self.flows_admitted.inc();
        self.active_flows.inc();
    }

    pub fn record_flow_finished(&self, status: FlowStatus) {
        let label = match status {
            FlowStatus::Completed => "completed",
            FlowStatus::Aborted => "aborted",
            FlowStatus::Errored => "errored",
            _ => return,
        };
        self.flows_finished.with_label_values(&[label]).inc();
        self.active_flows.dec();
    }

    pub fn record_duplicate(&self) {
        self.duplicate_events.inc();
    }

    pub fn record_simulated_loss(&self) {
        self.simulated_losses.inc();
    }

    pub fn record_breakpoint_opened(&self) {
        self.breakpoints_opened.inc();
        self.pending_breakpoints.inc();
    }

    pub fn record_breakpoint_closed(&self, held: std::time::Duration) {
        self.pending_breakpoints.dec();
        self.breakpoint_hold_duration.observe(held.as_secs_f64());
    }

    pub fn record_breakpoint_expired(&self) {
        self.breakpoints_expired.inc();
    }

    pub fn record_overflow(&self) {
        self.subscriber_overflows.inc();
    }

    pub fn record_adapter_error(&self) {
        self.adapter_errors.inc();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
