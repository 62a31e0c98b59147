use sv_core::branch::{BranchState, MAIN_NODE_ID};
use sv_core::collection::CollectionConfig;
use sv_core::feature::Feature;
use sv_core::modify::{ModifyFeaturesRequest, ModifyFeaturesResponse};
use sv_core::refs::{Ref, RefError};
use sv_storage::{
    CreateBranchRequest, CreateTagRequest, DeleteBranchRequest, DeleteTagRequest, FeatureStore,
    ProcessorRegistry, RecordMergeRequest, StoreConfig, StoreError, VersionSelection,
};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> FeatureStore {
    FeatureStore::open_with(
        dir.path(),
        StoreConfig::default(),
        ProcessorRegistry::with_defaults(),
    )
    .expect("store should open")
}

fn r(text: &str) -> Ref {
    Ref::parse(text).expect("ref should parse")
}

fn write(store: &FeatureStore, branch: &str, id: &str, name: &str) -> ModifyFeaturesResponse {
    let mut request = ModifyFeaturesRequest::new("city");
    request.branch = Some(branch.to_string());
    request.upsert_features.push(Feature::new(id).with_property("name", name));
    store.modify_features(request).expect("write")
}

fn name_at(store: &FeatureStore, id: &str, reference: &str) -> Option<String> {
    store
        .read_feature("city", id, &r(reference))
        .expect("read")
        .and_then(|f| f.properties.get("name").and_then(|v| v.as_str()).map(str::to_string))
}

/// `city` with `main` at version 2: `x` renamed once, `y` added at 2.
fn seeded(dir: &TempDir) -> FeatureStore {
    let store = open_store(dir);
    store
        .create_collection(CollectionConfig::new("city"))
        .expect("collection");
    write(&store, "main", "x", "first");
    let mut request = ModifyFeaturesRequest::new("city");
    request.upsert_features.push(Feature::new("x").with_property("name", "second"));
    request.insert_features.push(Feature::new("y").with_property("name", "why"));
    store.modify_features(request).expect("second write");
    store
}

fn branch(collection: &str, id: &str, base: &str) -> CreateBranchRequest {
    CreateBranchRequest {
        collection: collection.to_string(),
        branch_id: id.to_string(),
        base: r(base),
    }
}

#[test]
fn new_collections_start_with_an_empty_main_branch() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir);
    store
        .create_collection(CollectionConfig::new("city"))
        .expect("collection");
    assert!(matches!(
        store.create_collection(CollectionConfig::new("city")),
        Err(StoreError::CollectionAlreadyExists)
    ));

    let branches = store.list_branches("city").expect("branches");
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].id, "main");
    assert_eq!(branches[0].node_id, MAIN_NODE_ID);
    assert_eq!(branches[0].head_version, 0);
    assert!(branches[0].base_ref.is_none());

    assert!(matches!(
        store.list_branches("nowhere"),
        Err(StoreError::UnknownCollection)
    ));
    assert_eq!(
        store
            .list_collections()
            .expect("collections")
            .iter()
            .map(|c| c.id.as_str())
            .collect::<Vec<_>>(),
        vec!["city"]
    );
}

#[test]
fn branches_inherit_the_base_version_and_diverge() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = seeded(&dir);

    let dev = store
        .create_branch(branch("city", "dev", "main:1"))
        .expect("branch off version 1");
    assert_eq!(dev.head_version, 1);
    assert_eq!(dev.node_id, 1);
    assert_eq!(dev.base_ref, Some(r("main:1")));
    assert_eq!(dev.state, BranchState::Normal);

    assert_eq!(name_at(&store, "x", "dev:HEAD").as_deref(), Some("first"));
    assert_eq!(name_at(&store, "y", "dev:HEAD"), None);

    let response = write(&store, "dev", "x", "dev-only");
    assert_eq!(response.updated, vec!["x"]);
    assert_eq!(response.version, Some(2));
    assert_eq!(name_at(&store, "x", "dev:HEAD").as_deref(), Some("dev-only"));
    assert_eq!(name_at(&store, "x", "HEAD").as_deref(), Some("second"));
    assert_eq!(name_at(&store, "x", "dev:1").as_deref(), Some("first"));

    let mut delete = ModifyFeaturesRequest::new("city");
    delete.branch = Some("dev".to_string());
    delete.delete_features.insert("x".to_string(), None);
    store.modify_features(delete).expect("delete on dev");
    assert_eq!(name_at(&store, "x", "dev:HEAD"), None);
    assert_eq!(name_at(&store, "x", "HEAD").as_deref(), Some("second"));

    let nested = store
        .create_branch(branch("city", "dev-fix", "dev:HEAD"))
        .expect("branch of a branch");
    assert_eq!(nested.head_version, 3);
    assert_eq!(name_at(&store, "x", "dev-fix:HEAD"), None);
    assert_eq!(name_at(&store, "x", "dev-fix:2").as_deref(), Some("dev-only"));
}

#[test]
fn branch_creation_rejects_bad_bases() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = seeded(&dir);

    let ahead = store
        .create_branch(branch("city", "future", "main:9"))
        .expect_err("base beyond head");
    assert_eq!(ahead.code(), "INVALID_INPUT");

    let ranged = store
        .create_branch(branch("city", "ranged", "1..2"))
        .expect_err("ranges are not a base");
    assert_eq!(ranged.code(), "INVALID_INPUT");

    assert!(matches!(
        store.create_branch(branch("city", "orphan", "ghost:HEAD")),
        Err(StoreError::UnknownBranch)
    ));

    store
        .create_branch(branch("city", "dev", "HEAD"))
        .expect("first dev");
    assert!(matches!(
        store.create_branch(branch("city", "dev", "HEAD")),
        Err(StoreError::BranchAlreadyExists)
    ));
}

#[test]
fn only_empty_leaf_branches_can_be_deleted() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = seeded(&dir);
    store
        .create_branch(branch("city", "dev", "HEAD"))
        .expect("dev");
    store
        .create_branch(branch("city", "child", "dev:HEAD"))
        .expect("child");
    store
        .create_branch(branch("city", "busy", "HEAD"))
        .expect("busy");
    write(&store, "busy", "z", "zed");

    let delete = |id: &str| {
        store.delete_branch(DeleteBranchRequest {
            collection: "city".to_string(),
            branch_id: id.to_string(),
        })
    };
    assert_eq!(delete("main").expect_err("main stays").code(), "INVALID_INPUT");
    assert!(matches!(delete("dev"), Err(StoreError::BranchNotEmpty)));
    assert!(matches!(delete("busy"), Err(StoreError::BranchNotEmpty)));
    delete("child").expect("empty leaf");
    delete("dev").expect("now a leaf");
    assert!(matches!(delete("dev"), Err(StoreError::UnknownBranch)));
    assert_eq!(
        store.get_branch("city", "dev").expect("lookup"),
        None
    );
}

#[test]
fn tags_pin_versions_and_protect_system_tags() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = seeded(&dir);

    let tag = store
        .create_tag(CreateTagRequest {
            collection: "city".to_string(),
            tag_id: "release".to_string(),
            target: Ref::head(),
            system: false,
        })
        .expect("tag HEAD");
    assert_eq!(tag.version, 2);
    assert_eq!(tag.branch, "main");
    assert_eq!(tag.to_ref(), Some(r("2")));

    write(&store, "main", "x", "third");
    assert_eq!(name_at(&store, "x", "release").as_deref(), Some("second"));
    assert_eq!(name_at(&store, "x", "HEAD").as_deref(), Some("third"));

    assert!(matches!(
        store.create_tag(CreateTagRequest {
            collection: "city".to_string(),
            tag_id: "release".to_string(),
            target: r("1"),
            system: false,
        }),
        Err(StoreError::TagAlreadyExists)
    ));
    let invalid = store
        .create_tag(CreateTagRequest {
            collection: "city".to_string(),
            tag_id: "9lives".to_string(),
            target: r("1"),
            system: false,
        })
        .expect_err("tag ids start with a letter");
    assert_eq!(invalid.code(), "INVALID_INPUT");

    store
        .create_tag(CreateTagRequest {
            collection: "city".to_string(),
            tag_id: "checkpoint".to_string(),
            target: r("1"),
            system: true,
        })
        .expect("system tag");
    let delete = |id: &str| {
        store.delete_tag(DeleteTagRequest {
            collection: "city".to_string(),
            tag_id: id.to_string(),
        })
    };
    assert!(matches!(delete("checkpoint"), Err(StoreError::SystemTagProtected)));
    delete("release").expect("user tag");
    assert!(matches!(delete("release"), Err(StoreError::UnknownTag)));

    let tags = store.list_tags("city").expect("tags");
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].id, "checkpoint");
    assert!(store.get_tag("city", "release").expect("lookup").is_none());
}

#[test]
fn refs_resolve_against_stored_state() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = seeded(&dir);
    store
        .create_branch(branch("city", "dev", "main:1"))
        .expect("dev");
    for (tag_id, target) in [("v1", "1"), ("v2", "2")] {
        store
            .create_tag(CreateTagRequest {
                collection: "city".to_string(),
                tag_id: tag_id.to_string(),
                target: r(target),
                system: false,
            })
            .expect("tag");
    }

    let resolve = |text: &str| store.resolve_ref("city", &r(text));

    let head = resolve("HEAD").expect("head");
    assert_eq!(head.branch, "main");
    assert_eq!(head.selection, VersionSelection::Single(2));
    assert_eq!(resolve("dev:HEAD").expect("dev head").selection, VersionSelection::Single(1));
    assert_eq!(resolve("*").expect("all").selection, VersionSelection::All);
    assert_eq!(
        resolve("v1..HEAD").expect("range").selection,
        VersionSelection::Range { start: 1, end: 2 }
    );

    let tagged = resolve("dev:v2").expect("tags resolve on their own branch");
    assert_eq!(tagged.branch, "main");
    assert_eq!(tagged.version(), Some(2));
    assert_eq!(tagged.to_ref(), Some(r("2")));

    match resolve("v2..v1") {
        Err(StoreError::InvalidRef(RefError::RangeOutOfOrder { start, end })) => {
            assert_eq!((start, end), (2, 1));
        }
        other => panic!("unexpected resolution: {other:?}"),
    }
    assert!(matches!(resolve("ghost:HEAD"), Err(StoreError::UnknownBranch)));
    assert!(matches!(resolve("nope"), Err(StoreError::UnknownTag)));
    assert!(matches!(
        store.resolve_ref("elsewhere", &Ref::head()),
        Err(StoreError::UnknownCollection)
    ));
}

#[test]
fn merges_and_conflict_state_are_recorded() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = seeded(&dir);
    store
        .create_branch(branch("city", "dev", "main:1"))
        .expect("dev");
    store
        .create_branch(branch("city", "fix", "dev:HEAD"))
        .expect("fix");

    let main = store
        .record_merge(RecordMergeRequest {
            collection: "city".to_string(),
            branch_id: "main".to_string(),
            version: 2,
            source: r("dev:HEAD"),
        })
        .expect("merge");
    assert_eq!(main.merges.get(&2), Some(&r("dev:1")));

    let ahead = store
        .record_merge(RecordMergeRequest {
            collection: "city".to_string(),
            branch_id: "main".to_string(),
            version: 7,
            source: r("dev:1"),
        })
        .expect_err("merge version beyond head");
    assert_eq!(ahead.code(), "INVALID_INPUT");

    let dev = store
        .mark_branch_conflict("city", "dev", "fix")
        .expect("conflict");
    assert_eq!(dev.state, BranchState::InConflict);
    assert_eq!(dev.conflict_solving_branch.as_deref(), Some("fix"));

    let dev = store
        .resolve_branch_conflict("city", "dev")
        .expect("resolved");
    assert_eq!(dev.state, BranchState::Normal);
    assert_eq!(dev.conflict_solving_branch, None);

    let listed = store.get_branch("city", "main").expect("lookup").expect("main");
    assert_eq!(listed.merges.len(), 1);
}
