//! Tracked executions persisted through SQLite

#[cfg(test)]
mod tests {
    use flowtrail_core::{
        ConfigHandle, Error, FlowFilter, FlowStatus, FlowTrail, LogLevel, Metadata, TrackOptions,
        TrackingStore,
    };
    use flowtrail_store::SqliteStore;
    use std::sync::Arc;

    async fn trail() -> (FlowTrail, SqliteStore) {
        let store = SqliteStore::in_memory().await.unwrap();
        let trail = FlowTrail::new(Arc::new(store.clone()), ConfigHandle::default());
        (trail, store)
    }

    #[tokio::test]
    async fn test_tracked_run_is_persisted() {
        let (trail, store) = trail().await;

        let outcome = trail
            .track(TrackOptions::new("Exports::Ledger#perform"), |t| async move {
                t.update_progress(2, 4).await?;
                for _ in 0..3 {
                    t.ok().await?;
                }
                t.ko().await?;
                t.flow("upload", Metadata::new(), |step| async move {
                    step.debug("sending chunk", Metadata::new()).await?;
                    Ok::<_, Error>(())
                })
                .await?;
                Ok::<_, Error>("exported")
            })
            .await
            .unwrap();
        assert_eq!(outcome.result, "exported");

        let flow = store.get_flow(outcome.flow_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Completed);
        assert_eq!(flow.progress, 0.5);
        assert_eq!((flow.ok_count, flow.ko_count, flow.skip_count), (3, 1, 0));
        assert_eq!(flow.duration_ms, outcome.duration_ms);

        let entries = store.list_log_entries(flow.id, None).await.unwrap();
        let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["[upload] Started", "[upload] sending chunk", "[upload] Completed"]
        );
        let info_up = store.list_log_entries(flow.id, Some(LogLevel::Info)).await.unwrap();
        assert_eq!(info_up.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_run_is_persisted() {
        let (trail, store) = trail().await;

        let err = trail
            .track(TrackOptions::new("Exports::Ledger#perform"), |_| async move {
                Err::<(), anyhow::Error>(anyhow::anyhow!("bucket not writable"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bucket not writable");

        let failed = store
            .list_flows(&FlowFilter::default().with_status(FlowStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_message.as_deref(), Some("bucket not writable"));

        let stats = trail.process_stats("Exports::Ledger#perform").await.unwrap().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_cleanup_through_facade() {
        let (trail, store) = trail().await;
        trail
            .track(TrackOptions::new("Fresh::Job"), |_| async move { Ok::<_, Error>(()) })
            .await
            .unwrap();

        assert_eq!(trail.cleanup(Some(1)).await.unwrap(), 0);
        assert_eq!(store.list_flows(&FlowFilter::default()).await.unwrap().len(), 1);

        // a zero-day window removes everything created before now
        assert_eq!(trail.cleanup(Some(0)).await.unwrap(), 1);
        assert!(store.list_flows(&FlowFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_with_maximum_window_keeps_flows() {
        let (trail, store) = trail().await;
        trail
            .track(TrackOptions::new("Fresh::Job"), |_| async move { Ok::<_, Error>(()) })
            .await
            .unwrap();

        assert_eq!(trail.cleanup(Some(u32::MAX)).await.unwrap(), 0);
        assert_eq!(store.list_flows(&FlowFilter::default()).await.unwrap().len(), 1);
    }
}
