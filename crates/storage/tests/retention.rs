use sv_core::collection::CollectionConfig;
use sv_core::feature::Feature;
use sv_core::modify::ModifyFeaturesRequest;
use sv_core::refs::Ref;
use sv_core::retention::HistorySettings;
use sv_storage::{FeatureStore, ProcessorRegistry, StoreConfig, StoreError};
use tempfile::TempDir;

fn open_with_floor(dir: &TempDir, floor: u32) -> FeatureStore {
    let config = StoreConfig {
        default_max_version_count: floor,
        ..StoreConfig::default()
    };
    FeatureStore::open_with(dir.path(), config, ProcessorRegistry::with_defaults())
        .expect("store should open")
}

fn create(store: &FeatureStore, history: HistorySettings) {
    store
        .create_collection(CollectionConfig::new("buildings").with_history(history))
        .expect("collection should be created");
}

fn insert(store: &FeatureStore, id: &str) {
    let mut request = ModifyFeaturesRequest::new("buildings");
    request
        .insert_features
        .push(Feature::new(id).with_property("floors", 0));
    let response = store.modify_features(request).expect("insert");
    assert_eq!(response.inserted, vec![id]);
}

fn update_times(store: &FeatureStore, id: &str, times: usize) {
    for floors in 1..=times {
        let mut request = ModifyFeaturesRequest::new("buildings");
        request
            .update_features
            .push(Feature::new(id).with_property("floors", floors));
        let response = store.modify_features(request).expect("update");
        assert_eq!(response.updated, vec![id]);
    }
}

fn history(store: &FeatureStore, id: &str) -> Vec<Feature> {
    store
        .feature_history("buildings", id, &Ref::parse("*").expect("ref"))
        .expect("history")
}

fn versions(states: &[Feature]) -> Vec<u64> {
    states
        .iter()
        .map(|f| f.version().expect("stored version"))
        .collect()
}

#[test]
fn sequential_updates_build_a_linked_chain() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_with_floor(&dir, 10);
    create(&store, HistorySettings::unbounded());
    insert(&store, "b1");
    update_times(&store, "b1", 5);

    let states = history(&store, "b1");
    assert_eq!(states.len(), 5);
    assert_eq!(versions(&states), vec![1, 2, 3, 4, 5]);
    assert_eq!(states[0].meta.as_ref().expect("meta").puuid, None);
    for pair in states.windows(2) {
        let next = pair[1].meta.as_ref().expect("meta");
        assert_eq!(next.puuid.as_deref(), pair[0].uuid());
    }

    let head = store
        .read_feature("buildings", "b1", &Ref::head())
        .expect("read")
        .expect("head exists");
    assert_eq!(head.version(), Some(6));
    let head_meta = head.meta.as_ref().expect("meta");
    assert_eq!(head_meta.puuid.as_deref(), states[4].uuid());
    assert_eq!(head_meta.created_at, states[0].meta.as_ref().expect("meta").created_at);
    assert!(head_meta.updated_at >= states[4].meta.as_ref().expect("meta").updated_at);
}

#[test]
fn bounded_history_keeps_only_the_most_recent_states() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_with_floor(&dir, 10);
    create(&store, HistorySettings::keep_latest(3));
    insert(&store, "b1");
    insert(&store, "b2");
    update_times(&store, "b1", 7);

    assert_eq!(versions(&history(&store, "b1")), vec![6, 7, 8]);
    assert!(history(&store, "b2").is_empty());

    let range = store
        .feature_history("buildings", "b1", &Ref::parse("7..HEAD").expect("ref"))
        .expect("ranged history");
    assert_eq!(versions(&range), vec![7, 8]);
}

#[test]
fn unset_counts_fall_back_to_versions_to_keep_then_the_floor() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_with_floor(&dir, 2);
    create(&store, HistorySettings::default());
    insert(&store, "floor");
    update_times(&store, "floor", 4);
    assert_eq!(history(&store, "floor").len(), 2);

    store
        .update_collection(CollectionConfig::new("buildings").with_history(HistorySettings {
            versions_to_keep: Some(3),
            ..HistorySettings::default()
        }))
        .expect("raise the floor");
    insert(&store, "kept");
    update_times(&store, "kept", 4);
    assert_eq!(history(&store, "kept").len(), 3);
}

#[test]
fn disabled_history_appends_nothing() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_with_floor(&dir, 10);
    create(&store, HistorySettings::disabled());
    insert(&store, "b1");
    update_times(&store, "b1", 3);

    let mut request = ModifyFeaturesRequest::new("buildings");
    request.delete_features.insert("b1".to_string(), None);
    store.modify_features(request).expect("delete");

    assert!(history(&store, "b1").is_empty());
    assert!(
        store
            .read_feature("buildings", "b1", &Ref::head())
            .expect("read")
            .is_none()
    );
}

#[test]
fn tightening_the_bound_prunes_immediately() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_with_floor(&dir, 10);
    create(&store, HistorySettings::unbounded());
    insert(&store, "b1");
    insert(&store, "b2");
    update_times(&store, "b1", 6);
    update_times(&store, "b2", 3);
    assert_eq!(history(&store, "b1").len(), 6);

    store
        .update_collection(CollectionConfig::new("buildings").with_history(HistorySettings::keep_latest(2)))
        .expect("tighten");
    assert_eq!(versions(&history(&store, "b1")), vec![6, 7]);
    assert_eq!(history(&store, "b2").len(), 2);

    store
        .update_collection(CollectionConfig::new("buildings").with_history(HistorySettings::keep_latest(5)))
        .expect("loosen");
    assert_eq!(history(&store, "b1").len(), 2);
    update_times(&store, "b1", 4);
    assert_eq!(history(&store, "b1").len(), 5);
}

#[test]
fn maintenance_pass_applies_a_lowered_default_floor() {
    let dir = tempfile::tempdir().expect("temp dir");
    {
        let store = open_with_floor(&dir, 10);
        create(&store, HistorySettings::default());
        insert(&store, "b1");
        update_times(&store, "b1", 6);
        assert_eq!(history(&store, "b1").len(), 6);
    }

    let store = open_with_floor(&dir, 4);
    assert_eq!(store.prune_history("buildings").expect("prune"), 2);
    assert_eq!(history(&store, "b1").len(), 4);
    assert_eq!(store.prune_history("buildings").expect("second prune"), 0);

    assert!(matches!(
        store.prune_history("unknown"),
        Err(StoreError::UnknownCollection)
    ));
}

#[test]
fn invalid_retention_settings_are_rejected() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_with_floor(&dir, 10);
    let err = store
        .create_collection(CollectionConfig::new("buildings").with_history(HistorySettings {
            max_version_count: Some(-7),
            ..HistorySettings::default()
        }))
        .expect_err("negative counts other than -1 are invalid");
    assert_eq!(err.code(), "INVALID_INPUT");
}
