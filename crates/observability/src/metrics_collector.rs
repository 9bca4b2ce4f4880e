use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::debug;

/// 各组件共用的指标句柄
///
/// 句柄在构造时从当前全局记录器注册，所以应当在 `init_metrics` 之后创建。
/// 未安装记录器时所有操作都是空操作。
#[derive(Clone)]
pub struct MetricsCollector {
    // Producer metrics
    scenarios_published_total: Counter,
    work_queue_depth: Gauge,
    work_queue_consumers: Gauge,
    publish_rejections_total: Counter,
    model_publications_total: Counter,

    // Worker metrics
    scenarios_processed_total: Counter,
    scenario_errors_total: Counter,
    scenario_duration: Histogram,
    model_reloads_total: Counter,

    // Aggregator metrics
    results_aggregated_total: Counter,
    duplicate_results_total: Counter,
    dropped_messages_total: Counter,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            scenarios_published_total: counter!("montecarlo_scenarios_published_total"),
            work_queue_depth: gauge!("montecarlo_work_queue_depth"),
            work_queue_consumers: gauge!("montecarlo_work_queue_consumers"),
            publish_rejections_total: counter!("montecarlo_publish_rejections_total"),
            model_publications_total: counter!("montecarlo_model_publications_total"),
            scenarios_processed_total: counter!("montecarlo_scenarios_processed_total"),
            scenario_errors_total: counter!("montecarlo_scenario_errors_total"),
            scenario_duration: histogram!("montecarlo_scenario_duration_seconds"),
            model_reloads_total: counter!("montecarlo_model_reloads_total"),
            results_aggregated_total: counter!("montecarlo_results_aggregated_total"),
            duplicate_results_total: counter!("montecarlo_duplicate_results_total"),
            dropped_messages_total: counter!("montecarlo_dropped_messages_total"),
        }
    }

    pub fn record_scenarios_published(&self, count: u64) {
        self.scenarios_published_total.increment(count);
    }

    pub fn update_work_queue(&self, depth: u32, consumers: u32) {
        self.work_queue_depth.set(depth as f64);
        self.work_queue_consumers.set(consumers as f64);
    }

    pub fn record_publish_rejection(&self, queue: &str) {
        self.publish_rejections_total.increment(1);
        debug!(queue = queue, "Publish rejected by broker");
    }

    pub fn record_model_publication(&self) {
        self.model_publications_total.increment(1);
    }

    pub fn record_scenario_processed(&self, success: bool, duration_seconds: f64) {
        self.scenarios_processed_total.increment(1);
        if !success {
            self.scenario_errors_total.increment(1);
        }
        self.scenario_duration.record(duration_seconds);
    }

    pub fn record_model_reload(&self) {
        self.model_reloads_total.increment(1);
    }

    pub fn record_result_aggregated(&self) {
        self.results_aggregated_total.increment(1);
    }

    pub fn record_duplicate_result(&self) {
        self.duplicate_results_total.increment(1);
    }

    pub fn record_dropped_message(&self, queue: &str) {
        self.dropped_messages_total.increment(1);
        debug!(queue = queue, "Inbound message dropped");
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_metrics_are_rendered() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let collector = MetricsCollector::new();
            collector.record_scenarios_published(1000);
            collector.update_work_queue(1500, 2);
            collector.record_scenario_processed(false, 0.01);
            collector.record_duplicate_result();
        });

        let rendered = handle.render();
        assert!(rendered.contains("montecarlo_scenarios_published_total 1000"));
        assert!(rendered.contains("montecarlo_work_queue_depth 1500"));
        assert!(rendered.contains("montecarlo_work_queue_consumers 2"));
        assert!(rendered.contains("montecarlo_scenario_errors_total 1"));
        assert!(rendered.contains("montecarlo_duplicate_results_total 1"));
    }

    #[test]
    fn test_collector_without_recorder_is_noop() {
        let collector = MetricsCollector::default();
        collector.record_model_reload();
        collector.record_dropped_message("resultados");
    }
}
