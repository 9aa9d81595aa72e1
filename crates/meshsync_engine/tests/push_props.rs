//! Property: whatever a device holds, one push copies all of it.

use meshsync_engine::{OperationStatus, SyncRequest, SyncStorage};
use meshsync_protocol::SyncMode;
use meshsync_testkit::prelude::*;
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn push_delivers_every_entry(items in data_items_strategy(24), page_size in 1usize..6) {
        prop_assume!(!items.is_empty());
        init_tracing();
        let hub = VirtualHub::new();
        let source = MemoryStorage::new();
        source.put_sync_data(&items, "seed").unwrap();
        let a = TestDevice::spawn(&hub, "dev-a", source, test_config("dev-a").with_page_size(page_size)).unwrap();
        let b = TestDevice::spawn(&hub, "dev-b", MemoryStorage::new(), test_config("dev-b")).unwrap();

        let report = a
            .engine
            .sync(SyncRequest::new(vec!["dev-b".into()], SyncMode::Push))
            .unwrap()
            .wait(Duration::from_secs(10))
            .unwrap();

        prop_assert_eq!(report["dev-b"], OperationStatus::FinishedAll);
        prop_assert_eq!(b.storage.len(), items.len());
        for item in &items {
            prop_assert_eq!(b.storage.get(&item.key), Some(item.value.clone()));
        }
    }
}
