use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clusteval_plugin_host::{BuiltinCatalog, CompositeLoader, DylibLoader, ManifestLoader};
use clusteval_plugin_scanner::{CapabilityFinder, DiscoveryLoop, RemovalPolicy};
use clusteval_plugin_sdk::CapabilityKind;
use clusteval_registry::CapabilityRegistry;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn write_archive(path: &Path, contents: &str, secs: u64) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn distance_loop(plugin_root: &Path, registry: &Arc<CapabilityRegistry>) -> DiscoveryLoop {
    let loader = Arc::new(CompositeLoader::new(
        ManifestLoader::new(Arc::new(BuiltinCatalog::standard())),
        DylibLoader::new(plugin_root.join(".shadow")),
    ));
    let finder = CapabilityFinder::new(
        CapabilityKind::DistanceMeasure,
        plugin_root.join(CapabilityKind::DistanceMeasure.directory()),
        loader,
        Arc::clone(registry),
    );
    DiscoveryLoop::new(Arc::new(finder))
}

#[test]
fn archive_is_registered_and_hot_replaced() {
    let dir = tempdir().unwrap();
    let registry = Arc::new(CapabilityRegistry::new());
    let archive = dir
        .path()
        .join("distanceMeasures")
        .join("FooDistanceMeasure.jar");
    write_archive(&archive, r#"{ "version": "1" }"#, 1_000);
    let discovery = distance_loop(dir.path(), &registry);

    let report = discovery.run_once();
    assert_eq!(report.loaded, vec![archive.clone()]);
    let binding = registry
        .binding(CapabilityKind::DistanceMeasure, "Foo")
        .unwrap();
    assert_eq!(binding.descriptor.version.as_deref(), Some("1"));
    assert_eq!(binding.source.as_deref(), Some(archive.as_path()));

    write_archive(&archive, r#"{ "version": "2" }"#, 2_000);
    let report = discovery.run_once();
    assert_eq!(report.replaced, vec![archive.clone()]);
    let version = registry
        .lookup(CapabilityKind::DistanceMeasure, "Foo")
        .unwrap()
        .descriptor()
        .version;
    assert_eq!(version.as_deref(), Some("2"));
    assert_eq!(registry.names(CapabilityKind::DistanceMeasure), vec!["Foo"]);
}

#[test]
fn broken_replacement_keeps_last_known_good() {
    let dir = tempdir().unwrap();
    let registry = Arc::new(CapabilityRegistry::new());
    let archive = dir
        .path()
        .join("distanceMeasures")
        .join("FooDistanceMeasure.jar");
    write_archive(&archive, r#"{ "version": "1" }"#, 1_000);
    let discovery = distance_loop(dir.path(), &registry);
    discovery.run_once();

    write_archive(&archive, "not a manifest", 2_000);
    let report = discovery.run_once();
    assert_eq!(report.failed.len(), 1);
    let version = registry
        .descriptor(CapabilityKind::DistanceMeasure, "Foo")
        .unwrap()
        .version;
    assert_eq!(version.as_deref(), Some("1"));
}

#[test]
fn removal_policy_decides_binding_fate() {
    for (policy, expect_bound) in [
        (RemovalPolicy::RetainLastKnownGood, true),
        (RemovalPolicy::Purge, false),
    ] {
        let dir = tempdir().unwrap();
        let registry = Arc::new(CapabilityRegistry::new());
        let archive = dir
            .path()
            .join("distanceMeasures")
            .join("nested")
            .join("EuclidianDistanceMeasure.jar");
        write_archive(&archive, "", 1_000);
        let discovery = distance_loop(dir.path(), &registry).with_policy(policy);
        assert_eq!(discovery.run_once().loaded.len(), 1);

        fs::remove_file(&archive).unwrap();
        assert_eq!(discovery.run_once().removed, vec![archive]);
        assert_eq!(
            registry.contains(CapabilityKind::DistanceMeasure, "Euclidian"),
            expect_bound,
            "{policy:?}"
        );
    }
}
