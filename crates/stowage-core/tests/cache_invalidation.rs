//! Persistent cache validity: manifest hashing, tool-version stamping and
//! selective invalidation when ancestor sources change.

use std::path::{Path, PathBuf};

use stowage_core::{
    DefinitionScript, FieldValue, Loader, LoaderConfig, PersistentCache, RepositoryConfig,
    ScriptOrigin,
};

fn config(repo: &Path, cache: &Path, work: &Path) -> LoaderConfig {
    LoaderConfig {
        repositories: vec![RepositoryConfig {
            name: "core".to_string(),
            root: repo.to_path_buf(),
        }],
        installed_root: None,
        cache_root: cache.to_path_buf(),
        work_root: work.to_path_buf(),
        debug: false,
        strict: false,
    }
}

fn seed(repo: &Path, name: &str, body: &str) -> PathBuf {
    let dir = repo.join("base").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}-1.0.pkg.lua"));
    std::fs::write(&path, body).unwrap();
    path
}

fn script_for(path: &Path) -> DefinitionScript {
    DefinitionScript::from_path(path.to_path_buf(), ScriptOrigin::Repository("core".into()))
        .unwrap()
}

const BASE_LIB_V1: &str = "local pkg = require(\"pkg\")\n\
    local Base = pkg.class(pkg.Mod)\n\
    function Base:init()\n\
      self.stamp = \"v1\"\n\
    end\n\
    return { Base = Base }\n";

const DEPENDENT_BODY: &str = "local base = require(\"lib.base\")\n\
    local pkg = require(\"pkg\")\n\
    Package = pkg.class(base.Base)\n\
    function Package:init() end\n";

const STANDALONE_BODY: &str = "local pkg = require(\"pkg\")\n\
    Package = pkg.class(pkg.Mod)\n\
    function Package:init()\n\
      self.title = \"standalone\"\n\
    end\n";

#[test]
fn ancestor_edit_invalidates_only_dependents() {
    let repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();

    let lib_dir = repo.path().join("lib");
    std::fs::create_dir_all(&lib_dir).unwrap();
    let lib_path = lib_dir.join("base.lua");
    std::fs::write(&lib_path, BASE_LIB_V1).unwrap();

    let dependent = seed(repo.path(), "dependent", DEPENDENT_BODY);
    let standalone = seed(repo.path(), "standalone", STANDALONE_BODY);

    {
        let loader = Loader::new(config(repo.path(), cache.path(), work.path())).unwrap();
        let package = loader.load_one(&dependent).unwrap();
        assert_eq!(
            package.field("stamp").and_then(FieldValue::as_str),
            Some("v1")
        );
        loader.load_one(&standalone).unwrap();
    }

    let persist = PersistentCache::new(cache.path().to_path_buf());
    assert!(persist.load_valid(&script_for(&dependent)).is_some());
    assert!(persist.load_valid(&script_for(&standalone)).is_some());

    // One byte changes in the shared ancestor.
    std::fs::write(&lib_path, BASE_LIB_V1.replace("v1", "v2")).unwrap();

    assert!(
        persist.load_valid(&script_for(&dependent)).is_none(),
        "dependent entry must be invalidated by the ancestor edit"
    );
    assert!(
        persist.load_valid(&script_for(&standalone)).is_some(),
        "standalone entry must stay valid"
    );

    // A fresh loader re-executes the dependent and observes the new value.
    let loader = Loader::new(config(repo.path(), cache.path(), work.path())).unwrap();
    let outcome = loader.load_matching(None, Some("dependent")).unwrap();
    assert_eq!(
        outcome.packages[0].field("stamp").and_then(FieldValue::as_str),
        Some("v2")
    );
}

#[test]
fn script_edit_invalidates_its_entry() {
    let repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let path = seed(repo.path(), "thing", STANDALONE_BODY);

    Loader::new(config(repo.path(), cache.path(), work.path()))
        .unwrap()
        .load_one(&path)
        .unwrap();

    let persist = PersistentCache::new(cache.path().to_path_buf());
    assert!(persist.load_valid(&script_for(&path)).is_some());

    std::fs::write(&path, STANDALONE_BODY.replace("standalone", "changed")).unwrap();
    assert!(persist.load_valid(&script_for(&path)).is_none());

    let loader = Loader::new(config(repo.path(), cache.path(), work.path())).unwrap();
    let package = loader.load_one(&path).unwrap();
    assert_eq!(
        package.field("title").and_then(FieldValue::as_str),
        Some("changed")
    );
}

#[test]
fn tool_version_mismatch_is_a_miss() -> anyhow::Result<()> {
    let repo = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    let path = seed(repo.path(), "thing", STANDALONE_BODY);

    Loader::new(config(repo.path(), cache.path(), work.path()))?.load_one(&path)?;

    let persist = PersistentCache::new(cache.path().to_path_buf());
    let script = script_for(&path);
    let entry_path = persist.entry_path(&script);

    // Rewrite the record as if an older tool produced it.
    let raw = std::fs::read_to_string(&entry_path)?;
    let stamped = raw.replace(stowage_core::tool_version(), "0.0.1-old");
    std::fs::write(&entry_path, stamped)?;

    assert!(persist.load(&script).is_some());
    assert!(persist.load_valid(&script).is_none());
    Ok(())
}

#[test]
fn corrupt_entry_is_rebuilt_not_surfaced() -> anyhow::Result<()> {
    let repo = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let work = tempfile::tempdir()?;
    let path = seed(repo.path(), "thing", STANDALONE_BODY);

    Loader::new(config(repo.path(), cache.path(), work.path()))?.load_one(&path)?;

    let persist = PersistentCache::new(cache.path().to_path_buf());
    let entry_path = persist.entry_path(&script_for(&path));
    std::fs::write(&entry_path, "garbage{{{")?;

    // A fresh loader serves the script anyway and repairs the record.
    let loader = Loader::new(config(repo.path(), cache.path(), work.path()))?;
    let outcome = loader.load_matching(None, Some("thing"))?;
    assert_eq!(outcome.packages.len(), 1);
    assert_eq!(outcome.failures, 0);
    assert!(persist.load_valid(&script_for(&path)).is_some());
    Ok(())
}

#[test]
fn process_tier_invalidation_forces_rebuild() {
    let repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let path = seed(repo.path(), "thing", STANDALONE_BODY);

    let loader = Loader::new(config(repo.path(), cache.path(), work.path())).unwrap();
    let first = loader.load_one(&path).unwrap();
    let again = loader.load_one(&path).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &again));

    loader.invalidate(&path);
    let rebuilt = loader.load_one(&path).unwrap();
    assert!(!std::sync::Arc::ptr_eq(&first, &rebuilt));
    assert_eq!(first.fields, rebuilt.fields);
}

#[test]
fn cached_metadata_round_trips_field_for_field() {
    let repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let body = "local pkg = require(\"pkg\")\n\
        Package = pkg.class(pkg.Mod)\n\
        function Package:init()\n\
          self.title = \"rt\"\n\
          self.depends = { \"base/other\" }\n\
          self.meta = { weight = 1.5, group = \"x\" }\n\
        end\n";
    let path = seed(repo.path(), "thing", body);

    let executed = Loader::new(config(repo.path(), cache.path(), work.path()))
        .unwrap()
        .load_one(&path)
        .unwrap();

    // A second process: metadata comes from the persistent tier.
    let loader = Loader::new(config(repo.path(), cache.path(), work.path())).unwrap();
    let cached = loader.load_matching(None, Some("thing")).unwrap();
    assert_eq!(cached.packages[0].fields, executed.fields);
}
