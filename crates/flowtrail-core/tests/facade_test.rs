//! End-to-end tests for the tracking facade over the in-memory store

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use flowtrail_core::{
        perform_tracked, Category, ConfigHandle, Configuration, Error, Flow, FlowFilter,
        FlowMetrics, FlowStatus, FlowTrail, LogEntry, LogLevel, LogSink, LoggableValue,
        MemoryStore, Metadata, NewProcess, TrackOptions, TrackedJob, TrackingStore,
    };
    use futures::FutureExt;
    use serde_json::json;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn trail() -> (FlowTrail, MemoryStore) {
        let store = MemoryStore::new();
        let trail = FlowTrail::new(Arc::new(store.clone()), ConfigHandle::default());
        (trail, store)
    }

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn only_flow(store: &MemoryStore) -> Flow {
        let flows = store.list_flows(&FlowFilter::default()).await.unwrap();
        assert_eq!(flows.len(), 1);
        flows.into_iter().next().unwrap()
    }

    #[derive(Default)]
    struct CapturingSink {
        lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl LogSink for CapturingSink {
        fn log(&self, level: LogLevel, message: &str) -> anyhow::Result<()> {
            self.lines.lock().unwrap().push((level, message.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_successful_track() {
        let (trail, store) = trail();

        let outcome = trail
            .track(TrackOptions::new("Billing::InvoiceJob#perform"), |t| async move {
                t.info("generating invoices", Metadata::new()).await?;
                Ok::<_, Error>(42)
            })
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.result, 42);
        assert!(outcome.duration_ms.unwrap() >= 0);

        let flow = store.get_flow(outcome.flow_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Completed);
        assert_eq!(Some(flow.process_id), outcome.process_id);
        assert!(flow.finished_at.is_some());

        let process = store.get_process(flow.process_id).await.unwrap().unwrap();
        assert_eq!(process.name, "InvoiceJob");
        assert_eq!(process.category, Category::Jobs);
    }

    #[tokio::test]
    async fn test_failing_track_returns_same_error() {
        let (trail, store) = trail();

        let err = trail
            .track(TrackOptions::new("Sync::Orders"), |_| async move {
                Err::<(), anyhow::Error>(anyhow::anyhow!("upstream timed out"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "upstream timed out");

        let flow = only_flow(&store).await;
        assert_eq!(flow.status, FlowStatus::Failed);
        assert_eq!(flow.error_message.as_deref(), Some("upstream timed out"));
        assert!(flow.error_backtrace.is_some());
        assert!(flow.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_disabled_tracking_runs_work_once_without_rows() {
        let (trail, store) = trail();
        trail.configure(|c| c.enabled = false);
        let calls = AtomicUsize::new(0);

        let outcome = trail
            .track(TrackOptions::new("Reports::Daily"), |t| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    assert!(!t.is_enabled());
                    t.info("ignored", Metadata::new()).await?;
                    t.ok().await?;
                    Ok::<_, Error>("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(outcome.success);
        assert!(outcome.flow_id.is_none());
        assert!(outcome.process_id.is_none());
        assert_eq!(outcome.result, "done");
        assert_eq!(store.row_counts().await, (0, 0, 0));
    }

    #[tokio::test]
    async fn test_disabled_tracking_still_returns_work_error() {
        let (trail, store) = trail();
        trail.configure(|c| c.enabled = false);

        let err = trail
            .track(TrackOptions::new("Reports::Daily"), |_| async move {
                Err::<(), Error>(Error::internal("nope"))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert_eq!(store.row_counts().await, (0, 0, 0));
    }

    #[tokio::test]
    async fn test_disabled_start_returns_null_tracker() {
        let (trail, store) = trail();
        trail.configure(|c| c.enabled = false);

        let tracker = trail.start(TrackOptions::new("Manual::Disabled")).await.unwrap();
        assert!(!tracker.is_enabled());
        assert!(tracker.flow_id().is_none());
        tracker.info("ignored", Metadata::new()).await.unwrap();
        tracker.ok().await.unwrap();
        tracker.complete().await.unwrap();
        // no terminal state to guard, so a second transition is also a no-op
        tracker.complete().await.unwrap();
        assert_eq!(store.row_counts().await, (0, 0, 0));
    }

    #[tokio::test]
    async fn test_cleanup_deletes_old_flows_with_entries() {
        let (trail, store) = trail();
        let process = store
            .find_or_create_process(
                NewProcess::resolve("Cleanup::Target", None, Category::Jobs, None).unwrap(),
            )
            .await
            .unwrap();

        let mut ids = Vec::new();
        for age_days in [40, 35, 5] {
            let mut flow = Flow::start(&process, Metadata::new(), None, None);
            flow.created_at = Utc::now() - Duration::days(age_days);
            store.insert_flow(&flow).await.unwrap();
            let entry = LogEntry::new(flow.id, "line", LogLevel::Info, Metadata::new()).unwrap();
            store.insert_log_entry(&entry).await.unwrap();
            ids.push(flow.id);
        }

        assert_eq!(trail.cleanup(Some(30)).await.unwrap(), 2);
        assert_eq!(store.row_counts().await, (1, 1, 1));
        assert!(store.get_flow(ids[2]).await.unwrap().is_some());
        assert!(store.list_log_entries(ids[0], None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_defaults_to_configured_retention() {
        let (trail, store) = trail();
        trail.configure(|c| c.retention_days = 7);
        let process = store
            .find_or_create_process(
                NewProcess::resolve("Cleanup::Default", None, Category::Jobs, None).unwrap(),
            )
            .await
            .unwrap();
        let mut old = Flow::start(&process, Metadata::new(), None, None);
        old.created_at = Utc::now() - Duration::days(8);
        store.insert_flow(&old).await.unwrap();
        store
            .insert_flow(&Flow::start(&process, Metadata::new(), None, None))
            .await
            .unwrap();

        assert_eq!(trail.cleanup(None).await.unwrap(), 1);
        assert_eq!(store.row_counts().await.1, 1);
    }

    #[tokio::test]
    async fn test_nested_steps_share_one_flow() {
        let (trail, store) = trail();

        let outcome = trail
            .track(TrackOptions::new("Import::Catalog"), |t| async move {
                t.flow("outer", meta(json!({"batch": 1})), |outer| async move {
                    outer
                        .flow("inner", Metadata::new(), |inner| async move {
                            inner.info("parsing rows", Metadata::new()).await?;
                            Ok::<_, Error>(())
                        })
                        .await
                })
                .await
            })
            .await
            .unwrap();

        assert_eq!(store.row_counts().await.1, 1);
        let entries = store.list_log_entries(outcome.flow_id.unwrap(), None).await.unwrap();
        assert!(entries.iter().any(|e| e.message == "[outer.inner] parsing rows"));
        let started = entries.iter().find(|e| e.message == "[outer] Started").unwrap();
        assert_eq!(started.context["batch"], json!(1));
    }

    #[tokio::test]
    async fn test_repeated_transitions_are_rejected() {
        let (trail, store) = trail();
        let tracker = trail.start(TrackOptions::new("Manual::Run")).await.unwrap();

        tracker.complete().await.unwrap();
        assert!(tracker.complete().await.unwrap_err().is_invalid_state());
        assert!(tracker.fail(None).await.unwrap_err().is_invalid_state());
        assert!(tracker.mark_skipped(None).await.unwrap_err().is_invalid_state());
        assert_eq!(only_flow(&store).await.status, FlowStatus::Completed);
    }

    #[tokio::test]
    async fn test_metadata_merges_accumulate() {
        let (trail, store) = trail();
        let options =
            TrackOptions::new("Meta::Merge").with_metadata(meta(json!({"source": "api"})));

        trail
            .track(options, |t| async move {
                t.update_metadata(meta(json!({"a": 1}))).await?;
                t.update_metadata(meta(json!({"b": 2}))).await?;
                Ok::<_, Error>(())
            })
            .await
            .unwrap();

        let flow = only_flow(&store).await;
        assert_eq!(
            serde_json::Value::Object(flow.metadata),
            json!({"source": "api", "a": 1, "b": 2})
        );
    }

    #[tokio::test]
    async fn test_panic_fails_flow_and_resumes() {
        let (trail, store) = trail();

        let caught = AssertUnwindSafe(trail.track(TrackOptions::new("Panics::Job"), |_| async move {
            if true {
                panic!("index out of range");
            }
            Ok::<(), Error>(())
        }))
        .catch_unwind()
        .await;

        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"index out of range"));

        let flow = only_flow(&store).await;
        assert_eq!(flow.status, FlowStatus::Failed);
        assert_eq!(flow.error_message.as_deref(), Some("index out of range"));
    }

    #[tokio::test]
    async fn test_dropped_execution_is_failed() {
        let (trail, store) = trail();

        let pending = trail.track(TrackOptions::new("Slow::Job"), |_| async move {
            std::future::pending::<Result<(), Error>>().await
        });
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(20), pending).await;
        assert!(timed_out.is_err());

        let mut status = FlowStatus::Running;
        for _ in 0..50 {
            status = only_flow(&store).await.status;
            if status != FlowStatus::Running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status, FlowStatus::Failed);
    }

    #[tokio::test]
    async fn test_work_may_finish_its_own_flow() {
        let (trail, store) = trail();

        let outcome = trail
            .track(TrackOptions::new("Skips::Itself"), |t| async move {
                t.mark_skipped(Some("nothing to import".into())).await?;
                Ok::<_, Error>(())
            })
            .await
            .unwrap();

        assert!(outcome.success);
        let flow = only_flow(&store).await;
        assert_eq!(flow.status, FlowStatus::Skipped);
        assert_eq!(flow.error_message.as_deref(), Some("nothing to import"));
    }

    #[tokio::test]
    async fn test_work_that_fails_its_own_flow_still_succeeds() {
        let (trail, store) = trail();

        let outcome = trail
            .track(TrackOptions::new("Fails::Itself"), |t| async move {
                t.fail(None).await?;
                Ok::<_, Error>("partial")
            })
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.result, "partial");
        assert_eq!(only_flow(&store).await.status, FlowStatus::Failed);
    }

    #[tokio::test]
    async fn test_options_are_applied() {
        let (trail, store) = trail();
        trail.configure(|c| c.default_category = Category::Services);

        trail
            .track(
                TrackOptions::new("Gateway::Charge")
                    .with_name("Charge card")
                    .with_correlation_id("req-9")
                    .with_triggered_by("webhook"),
                |_| async move { Ok::<_, Error>(()) },
            )
            .await
            .unwrap();

        let flow = only_flow(&store).await;
        assert_eq!(flow.correlation_id, "req-9");
        assert_eq!(flow.triggered_by.as_deref(), Some("webhook"));
        let process = store.get_process(flow.process_id).await.unwrap().unwrap();
        assert_eq!(process.name, "Charge card");
        assert_eq!(process.category, Category::Services);
    }

    #[tokio::test]
    async fn test_empty_identifier_is_rejected() {
        let (trail, store) = trail();
        let calls = AtomicUsize::new(0);

        let err = trail
            .track(TrackOptions::new("   "), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, Error>(()) }
            })
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.row_counts().await, (0, 0, 0));
    }

    #[tokio::test]
    async fn test_process_is_reused_across_runs() {
        let (trail, store) = trail();
        for _ in 0..3 {
            trail
                .track(TrackOptions::new("Repeat::Job"), |t| async move {
                    t.ok().await?;
                    Ok::<_, Error>(())
                })
                .await
                .unwrap();
        }
        trail
            .track(TrackOptions::new("Repeat::Job"), |_| async move {
                Err::<(), Error>(Error::internal("bad row"))
            })
            .await
            .unwrap_err();

        assert_eq!(store.list_processes().await.unwrap().len(), 1);
        let stats = trail.process_stats("Repeat::Job").await.unwrap().unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert!(stats.last_run_at.is_some());
        assert!(trail.process_stats("Unknown::Job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mirroring_follows_configuration() {
        let store = MemoryStore::new();
        let sink = Arc::new(CapturingSink::default());
        let trail = FlowTrail::new(Arc::new(store.clone()), ConfigHandle::default())
            .with_sink(sink.clone() as Arc<dyn LogSink>);

        trail
            .track(TrackOptions::new("Mirror::On"), |t| async move {
                t.warn("low disk", Metadata::new()).await?;
                Ok::<_, Error>(())
            })
            .await
            .unwrap();
        assert_eq!(sink.lines.lock().unwrap().len(), 1);

        trail.configure(|c| c.mirror_to_external_logger = false);
        trail
            .track(TrackOptions::new("Mirror::Off"), |t| async move {
                t.warn("low disk", Metadata::new()).await?;
                Ok::<_, Error>(())
            })
            .await
            .unwrap();
        assert_eq!(sink.lines.lock().unwrap().len(), 1);
        assert_eq!(store.row_counts().await.2, 2);
    }

    #[tokio::test]
    async fn test_failure_is_mirrored() {
        let store = MemoryStore::new();
        let sink = Arc::new(CapturingSink::default());
        let trail = FlowTrail::new(Arc::new(store), ConfigHandle::default())
            .with_sink(sink.clone() as Arc<dyn LogSink>);

        trail
            .track(TrackOptions::new("Mirror::Fail"), |_| async move {
                Err::<(), Error>(Error::internal("exploded"))
            })
            .await
            .unwrap_err();

        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, LogLevel::Error);
        assert!(lines[0].1.contains("exploded"));
    }

    #[tokio::test]
    async fn test_reset_configuration() {
        let (trail, _) = trail();
        trail.configure(|c| {
            c.enabled = false;
            c.retention_days = 3;
        });
        assert!(!trail.configuration().enabled);
        trail.reset_configuration();
        assert_eq!(*trail.configuration(), Configuration::default());
    }

    #[tokio::test]
    async fn test_metrics_follow_flows() {
        let store = MemoryStore::new();
        let metrics = Arc::new(FlowMetrics::new().unwrap());
        let trail = FlowTrail::new(Arc::new(store), ConfigHandle::default())
            .with_metrics(metrics.clone());

        trail
            .track(TrackOptions::new("Metrics::Ok"), |_| async move { Ok::<_, Error>(()) })
            .await
            .unwrap();
        trail
            .track(TrackOptions::new("Metrics::Ko"), |_| async move {
                Err::<(), Error>(Error::internal("x"))
            })
            .await
            .unwrap_err();

        let families = metrics.registry().gather();
        let value = |name: &str| {
            families
                .iter()
                .find(|f| f.get_name() == name)
                .map(|f| f.get_metric()[0].get_counter().get_value())
        };
        assert_eq!(value("flowtrail_flows_started_total"), Some(2.0));
        assert_eq!(value("flowtrail_flows_completed_total"), Some(1.0));
        assert_eq!(value("flowtrail_flows_failed_total"), Some(1.0));
    }

    struct NewsletterJob;

    impl TrackedJob for NewsletterJob {
        fn identifier(&self) -> String {
            "Mailers::NewsletterJob".into()
        }

        fn display_name(&self) -> Option<String> {
            Some("Weekly newsletter".into())
        }

        fn job_id(&self) -> Option<String> {
            Some("jid-77".into())
        }

        fn queue_name(&self) -> Option<String> {
            Some("mailers".into())
        }

        fn arguments(&self) -> Vec<LoggableValue> {
            vec!["x".repeat(150).into(), json!(["a", "b", "c", "d", "e"]).into()]
        }
    }

    #[tokio::test]
    async fn test_perform_tracked_job() {
        let (trail, store) = trail();

        let outcome = perform_tracked(&trail, &NewsletterJob, |t| async move {
            t.update_progress(1, 2).await?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();
        assert!(outcome.success);

        let flow = only_flow(&store).await;
        assert_eq!(flow.correlation_id, "jid-77");
        assert_eq!(flow.triggered_by.as_deref(), Some("mailers"));
        assert_eq!(flow.progress, 0.5);
        assert_eq!(flow.metadata["queue_name"], json!("mailers"));
        let args = flow.metadata["arguments"].as_array().unwrap();
        assert_eq!(args[0].as_str().unwrap().len(), 103);
        assert_eq!(args[1], json!(["a", "b", "c"]));

        let process = store.get_process(flow.process_id).await.unwrap().unwrap();
        assert_eq!(process.name, "Weekly newsletter");
    }

    #[tokio::test]
    async fn test_job_category_defaults_to_configuration() {
        let (trail, store) = trail();
        trail.configure(|c| c.default_category = Category::Services);

        perform_tracked(&trail, &NewsletterJob, |_| async move { Ok::<_, Error>(()) })
            .await
            .unwrap();

        let process = store.get_process(only_flow(&store).await.process_id).await.unwrap().unwrap();
        assert_eq!(process.category, Category::Services);
    }

    struct WebhookJob;

    impl TrackedJob for WebhookJob {
        fn identifier(&self) -> String {
            "Hooks::DeliveryJob".into()
        }

        fn category(&self) -> Option<Category> {
            Some(Category::Api)
        }
    }

    #[tokio::test]
    async fn test_job_category_override() {
        let (trail, store) = trail();
        trail.configure(|c| c.default_category = Category::Services);

        perform_tracked(&trail, &WebhookJob, |_| async move { Ok::<_, Error>(()) })
            .await
            .unwrap();

        let process = store.get_process(only_flow(&store).await.process_id).await.unwrap().unwrap();
        assert_eq!(process.category, Category::Api);
    }
}
