// End-to-end runs: the real thread-per-stage pipeline with the controller attached.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use deadline_rebalancer::config::{AdmissionConfig, ControllerConfig, PipelineConfig};
    use deadline_rebalancer::context::InitStatus;
    use deadline_rebalancer::gateway::{GatewayCall, InMemoryGateway, SchedulingGateway};
    use deadline_rebalancer::{
        BandwidthController, ControllerError, LinuxGateway, Pipeline, PipelineRuntime,
    };

    const PERIOD: u64 = 1_000_000;

    fn pipeline_config(tasks: u64) -> PipelineConfig {
        PipelineConfig {
            tasks,
            workers: 3,
            source_cost: Duration::from_micros(1),
            sink_cost: Duration::from_micros(1),
            stage_cost_step: Duration::from_micros(20),
            queue_capacity: None,
        }
    }

    fn controller_config(stages: usize) -> ControllerConfig {
        ControllerConfig {
            stage_count: stages,
            period_ns: PERIOD,
            admission: AdmissionConfig {
                cpu_count: 4,
                max_utilization: 0.95,
            },
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn test_dry_run_completes_and_conserves_bandwidth() {
        let gateway = Arc::new(InMemoryGateway::recording());
        let pipeline = Arc::new(
            Pipeline::new(pipeline_config(2_000), PERIOD, gateway.clone()).unwrap(),
        );
        let context = pipeline.context();
        let controller = BandwidthController::new(
            controller_config(pipeline.stage_count()),
            gateway.clone(),
            pipeline.clone(),
            context.clone(),
        )
        .unwrap();

        let handle = controller.spawn().unwrap();
        pipeline.start().unwrap();
        assert_eq!(pipeline.join().unwrap(), 2_000);
        let run = handle.join().unwrap();

        assert!(context.should_stop());
        assert!(run.report.run_time_secs.is_some());
        assert_eq!(run.report.bootstrap_quotas, vec![Some(200_000); 4]);

        let before: u64 = run.report.bootstrap_quotas.iter().flatten().sum();
        let after: u64 = run.report.final_quotas.iter().flatten().sum();
        assert_eq!(before, after);
        assert_eq!(run.report.stats.gateway_failures, 0);
        assert!(run.report.samples_recorded as u64 <= run.report.stats.ticks);

        // The first commit on every stage widened its affinity.
        let calls = gateway.calls();
        let first_sets: Vec<bool> = (0..pipeline.stage_count())
            .map(|stage| {
                let tid = pipeline.stage_thread_id(stage).unwrap();
                calls
                    .iter()
                    .find_map(|call| match call {
                        GatewayCall::Set {
                            tid: t,
                            set_affinity,
                            ..
                        } if *t == tid => Some(*set_affinity),
                        _ => None,
                    })
                    .unwrap()
            })
            .collect();
        assert!(first_sets.iter().all(|affinity| *affinity));

        // Live attributes match the controller's final table.
        for (stage, quota) in run.report.final_quotas.iter().enumerate() {
            let tid = pipeline.stage_thread_id(stage).unwrap();
            assert_eq!(Some(gateway.attributes(tid).unwrap().runtime), *quota);
        }
    }

    #[test]
    fn test_history_rows_match_csv() {
        let gateway = Arc::new(InMemoryGateway::new());
        let pipeline = Arc::new(
            Pipeline::new(pipeline_config(500), PERIOD, gateway.clone()).unwrap(),
        );
        let context = pipeline.context();
        let controller = BandwidthController::new(
            controller_config(pipeline.stage_count()),
            gateway,
            pipeline.clone(),
            context,
        )
        .unwrap();

        let handle = controller.spawn().unwrap();
        pipeline.start().unwrap();
        pipeline.join().unwrap();
        let run = handle.join().unwrap();

        let mut csv = Vec::new();
        run.history.write_csv(&mut csv).unwrap();
        let text = String::from_utf8(csv).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("abs_time,rel_time,node_#0,node_#1,node_#2,node_#3,runtime_#0,runtime_#1,runtime_#2,runtime_#3")
        );
        assert_eq!(lines.count(), run.report.samples_recorded);
    }

    #[test]
    fn test_denied_policy_stops_controller_but_not_pipeline() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.deny_all();
        let pipeline = Arc::new(
            Pipeline::new(pipeline_config(200), PERIOD, gateway.clone()).unwrap(),
        );
        let context = pipeline.context();
        let controller = BandwidthController::new(
            controller_config(pipeline.stage_count()),
            gateway.clone(),
            pipeline.clone(),
            context.clone(),
        )
        .unwrap();

        let handle = controller.spawn().unwrap();
        pipeline.start().unwrap();
        let result = handle.join();
        assert!(matches!(
            result,
            Err(ControllerError::PolicyDenied { stage: 0, .. })
        ));
        assert_eq!(pipeline.join().unwrap(), 200);
        assert!(matches!(
            context.init_status(0),
            Some(InitStatus::Denied { .. })
        ));
    }

    #[test]
    fn test_stop_request_ends_source_early() {
        let gateway = Arc::new(InMemoryGateway::new());
        let mut config = pipeline_config(1_000_000);
        config.stage_cost_step = Duration::from_micros(50);
        config.queue_capacity = Some(16);
        let pipeline = Arc::new(Pipeline::new(config, PERIOD, gateway.clone()).unwrap());
        let context = pipeline.context();
        let controller = BandwidthController::new(
            controller_config(pipeline.stage_count()),
            gateway,
            pipeline.clone(),
            context.clone(),
        )
        .unwrap();

        let handle = controller.spawn().unwrap();
        pipeline.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        context.request_stop();

        let processed = pipeline.join().unwrap();
        assert!(processed < 1_000_000);
        assert!(handle.join().is_ok());
    }

    #[test]
    #[ignore = "requires CAP_SYS_NICE and SCHED_DEADLINE"]
    fn test_real_kernel_run() {
        let gateway: Arc<dyn SchedulingGateway> = Arc::new(LinuxGateway::new());
        let pipeline = Arc::new(Pipeline::new(pipeline_config(5_000), PERIOD, gateway.clone()).unwrap());
        let context = pipeline.context();
        let config = ControllerConfig {
            stage_count: pipeline.stage_count(),
            period_ns: PERIOD,
            admission: AdmissionConfig::detect(),
            ..ControllerConfig::default()
        };
        let controller =
            BandwidthController::new(config, gateway, pipeline.clone(), context).unwrap();

        let handle = controller.spawn().unwrap();
        pipeline.start().unwrap();
        assert_eq!(pipeline.join().unwrap(), 5_000);
        let run = handle.join().unwrap();
        let before: u64 = run.report.bootstrap_quotas.iter().flatten().sum();
        let after: u64 = run.report.final_quotas.iter().flatten().sum();
        assert!(after <= before);
    }
}
