//! Full publish cycles against a local directory mirror.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use repo_publisher::config::RepositoryInfo;
use repo_publisher::filesystem::sha256_hex;
use repo_publisher::index::NativeIndexer;
use repo_publisher::mirror::LocalMirror;
use repo_publisher::publish::lock::RunLock;
use repo_publisher::publish::manifest::RunStatus;
use repo_publisher::publish::{last_run, recover, APT_HOLDING_DIR, APT_TREE_DIR, LOCK_FILE};
use repo_publisher::signer::Signer;
use repo_publisher::{AptPublisher, PublishContext, Step};
use tempfile::TempDir;
use time::OffsetDateTime;
use walkdir::WalkDir;

/// Keyed digest standing in for OpenPGP. Refuses to sign one codename.
struct TestSigner {
    refuse: Option<&'static str>,
}

impl TestSigner {
    fn mac(bytes: &[u8]) -> Vec<u8> {
        let mut keyed = b"test-key:".to_vec();
        keyed.extend_from_slice(bytes);
        sha256_hex(&keyed).into_bytes()
    }

    fn check(&self, file: &Path) -> Result<Vec<u8>> {
        let text = fs::read(file)?;
        if let Some(codename) = self.refuse {
            let marker = format!("Codename: {codename}\n");
            if String::from_utf8_lossy(&text).contains(&marker) {
                bail!("secret key not available");
            }
        }
        Ok(text)
    }
}

impl Signer for TestSigner {
    fn detach_sign(&self, file: &Path) -> Result<Vec<u8>> {
        Ok(Self::mac(&self.check(file)?))
    }

    fn clear_sign(&self, file: &Path) -> Result<Vec<u8>> {
        let mut out = self.check(file)?;
        out.extend_from_slice(b"-----SIGNATURE-----\n");
        out.extend_from_slice(&Self::mac(&fs::read(file)?));
        Ok(out)
    }

    fn verify_detached(&self, file: &Path, signature: &Path) -> Result<()> {
        if fs::read(signature)? != Self::mac(&fs::read(file)?) {
            bail!("bad signature");
        }
        Ok(())
    }
}

struct Fixture {
    _tmp: TempDir,
    remote: PathBuf,
    work: PathBuf,
    incoming: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote");
        let work = tmp.path().join("work");
        let incoming = tmp.path().join("incoming");
        let pool = remote.join("pool/main");
        fs::create_dir_all(&pool).unwrap();
        fs::create_dir_all(&incoming).unwrap();
        for name in [
            "bullseye-foo_1.0_amd64.deb",
            "focal-foo_1.1_amd64.deb",
            "focal-baz_3.0_arm64.deb",
            "focal-docs_2.0_all.deb",
        ] {
            fs::write(pool.join(name), format!("payload of {name}")).unwrap();
        }
        // Left over from an earlier publish that still had arm64 packages.
        let stale = remote.join("dists/bullseye/main/binary-arm64");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("Packages"), "Package: gone\n").unwrap();

        Self {
            _tmp: tmp,
            remote,
            work,
            incoming,
        }
    }

    fn publisher(&self, refuse: Option<&'static str>) -> AptPublisher {
        AptPublisher::new(
            RepositoryInfo {
                origin: "Example".into(),
                label: "Example".into(),
                version: "1.0".into(),
                description: "Example packages".into(),
                component: "main".into(),
            },
            vec!["bullseye".into(), "focal".into()],
            vec!["amd64".into(), "arm64".into()],
            Box::new(LocalMirror::new(self.remote.clone())),
            Box::new(NativeIndexer),
            Box::new(TestSigner { refuse }),
        )
    }

    fn context(&self, incoming: Vec<PathBuf>) -> PublishContext {
        PublishContext {
            work_dir: self.work.clone(),
            released_at: OffsetDateTime::from_unix_timestamp(1_792_314_300).unwrap(),
            incoming,
        }
    }

    fn read_remote(&self, rel: &str) -> String {
        fs::read_to_string(self.remote.join(rel)).unwrap()
    }
}

fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().display().to_string();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

fn listed_packages(packages: &str) -> Vec<String> {
    packages
        .lines()
        .filter_map(|l| l.strip_prefix("Filename: pool/main/"))
        .map(str::to_string)
        .collect()
}

#[test]
fn publishes_each_codename_from_its_own_slice_of_the_pool() {
    let fx = Fixture::new();
    let report = fx.publisher(None).publish(&fx.context(vec![])).unwrap();

    assert_eq!(report.codenames.len(), 2);
    assert_eq!(report.codenames[0].architectures, vec!["amd64"]);
    assert_eq!(report.codenames[1].architectures, vec!["amd64", "arm64"]);
    let summary = report.to_string();
    assert!(summary.starts_with("published 2 codename(s) to "));
    assert!(summary.ends_with("; bullseye: 1 package(s) [amd64]; focal: 4 package(s) [amd64,arm64]"));

    let bullseye_amd64 = fx.read_remote("dists/bullseye/main/binary-amd64/Packages");
    assert_eq!(listed_packages(&bullseye_amd64), vec!["bullseye-foo_1.0_amd64.deb"]);

    let focal_amd64 = fx.read_remote("dists/focal/main/binary-amd64/Packages");
    assert_eq!(
        listed_packages(&focal_amd64),
        vec!["focal-docs_2.0_all.deb", "focal-foo_1.1_amd64.deb"]
    );
    let focal_arm64 = fx.read_remote("dists/focal/main/binary-arm64/Packages");
    assert_eq!(
        listed_packages(&focal_arm64),
        vec!["focal-baz_3.0_arm64.deb", "focal-docs_2.0_all.deb"]
    );

    // Empty architecture: stale index removed, not advertised.
    assert!(!fx.remote.join("dists/bullseye/main/binary-arm64").exists());
    let release = fx.read_remote("dists/bullseye/Release");
    assert!(release.contains("Architectures: amd64\n"));
    assert!(!release.contains("binary-arm64"));

    // The whole pool is pushed back and nothing lingers in the holding area.
    let pool = snapshot(&fx.remote.join("pool/main"));
    assert_eq!(pool.len(), 4);
    assert!(snapshot(&fx.work.join(APT_HOLDING_DIR)).is_empty());

    let manifest = last_run(&fx.work).unwrap().unwrap();
    assert_eq!(manifest.status, RunStatus::Success);
    assert_eq!(manifest.codenames_completed, vec!["bullseye", "focal"]);
}

#[test]
fn release_lists_every_index_file_with_its_digest() {
    let fx = Fixture::new();
    fx.publisher(None).publish(&fx.context(vec![])).unwrap();

    let dist = fx.remote.join("dists/focal");
    let release = fx.read_remote("dists/focal/Release");
    assert!(release.starts_with(
        "Origin: Example\nLabel: Example\nSuite: focal\nCodename: focal\nVersion: 1.0\n\
         Date: Sun, 18 Oct 2026 09:05:00 UTC\nArchitectures: amd64,arm64\nComponents: main\n\
         Description: Example packages\nSHA256:\n"
    ));

    let sha256_block: Vec<&str> = release
        .lines()
        .skip_while(|l| *l != "SHA256:")
        .skip(1)
        .take_while(|l| l.starts_with(' '))
        .collect();
    let listed: Vec<&str> = sha256_block
        .iter()
        .map(|l| l.split_whitespace().nth(2).unwrap())
        .collect();
    assert_eq!(
        listed,
        vec![
            "main/binary-amd64/Packages",
            "main/binary-amd64/Packages.gz",
            "main/binary-arm64/Packages",
            "main/binary-arm64/Packages.gz",
        ]
    );
    for line in sha256_block {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let bytes = fs::read(dist.join(fields[2])).unwrap();
        assert_eq!(fields[0], sha256_hex(&bytes));
        assert_eq!(fields[1], bytes.len().to_string());
    }

    for file in ["Release.pgp", "InRelease"] {
        assert!(dist.join(file).is_file(), "{file} missing");
    }
}

#[test]
fn repeated_runs_produce_identical_trees() {
    let fx = Fixture::new();
    let publisher = fx.publisher(None);

    publisher.publish(&fx.context(vec![])).unwrap();
    let first = snapshot(&fx.remote);
    publisher.publish(&fx.context(vec![])).unwrap();
    let second = snapshot(&fx.remote);

    assert_eq!(first, second);
}

#[test]
fn signing_failure_aborts_without_pushing_and_restores_the_pool() {
    let fx = Fixture::new();
    let before = snapshot(&fx.remote);

    let err = fx
        .publisher(Some("focal"))
        .publish(&fx.context(vec![]))
        .unwrap_err();

    assert_eq!(err.step, Step::Sign);
    assert_eq!(err.codename.as_deref(), Some("focal"));
    assert_eq!(snapshot(&fx.remote), before);

    let local_pool = snapshot(&fx.work.join(APT_TREE_DIR).join("pool/main"));
    assert_eq!(local_pool.len(), 4);
    assert!(snapshot(&fx.work.join(APT_HOLDING_DIR)).is_empty());
    let focal = fx.work.join(APT_TREE_DIR).join("dists/focal");
    assert!(!focal.join("Release.pgp").exists());
    assert!(!focal.join("InRelease").exists());

    let manifest = last_run(&fx.work).unwrap().unwrap();
    assert_eq!(manifest.status, RunStatus::Failed);
    assert_eq!(manifest.failed_step, Some(Step::Sign));
    assert_eq!(manifest.failed_codename.as_deref(), Some("focal"));
    assert_eq!(manifest.codenames_completed, vec!["bullseye"]);
}

#[test]
fn interrupted_run_leftovers_are_merged_before_publishing() {
    let fx = Fixture::new();
    fx.publisher(None).publish(&fx.context(vec![])).unwrap();

    // A crash between select and restore leaves the other codenames held.
    let holding = fx.work.join(APT_HOLDING_DIR);
    let local_pool = fx.work.join(APT_TREE_DIR).join("pool/main");
    fs::rename(
        local_pool.join("focal-baz_3.0_arm64.deb"),
        holding.join("focal-baz_3.0_arm64.deb"),
    )
    .unwrap();
    fs::copy(
        local_pool.join("focal-foo_1.1_amd64.deb"),
        holding.join("focal-foo_1.1_amd64.deb"),
    )
    .unwrap();
    // Admitted by the interrupted run but never pushed.
    fs::write(holding.join("focal-extra_1.0_arm64.deb"), "extra").unwrap();

    fx.publisher(None).publish(&fx.context(vec![])).unwrap();

    assert!(snapshot(&holding).is_empty());
    let focal_arm64 = fx.read_remote("dists/focal/main/binary-arm64/Packages");
    assert_eq!(
        listed_packages(&focal_arm64),
        vec![
            "focal-baz_3.0_arm64.deb",
            "focal-docs_2.0_all.deb",
            "focal-extra_1.0_arm64.deb",
        ]
    );
}

#[test]
fn conflicting_leftover_stops_the_run() {
    let fx = Fixture::new();
    let holding = fx.work.join(APT_HOLDING_DIR);
    fs::create_dir_all(&holding).unwrap();
    fs::write(holding.join("focal-foo_1.1_amd64.deb"), "different bytes").unwrap();
    let before = snapshot(&fx.remote);

    let err = fx.publisher(None).publish(&fx.context(vec![])).unwrap_err();

    assert_eq!(err.step, Step::Recover);
    assert_eq!(snapshot(&fx.remote), before);
    assert!(holding.join("focal-foo_1.1_amd64.deb").exists());
}

#[test]
fn held_artifacts_survive_recover_and_the_next_pull() {
    let fx = Fixture::new();
    fx.publisher(None).publish(&fx.context(vec![])).unwrap();
    // Crash mid-codename: an artifact admitted locally sits only in holding.
    let holding = fx.work.join(APT_HOLDING_DIR);
    fs::create_dir_all(&holding).unwrap();
    fs::write(holding.join("focal-extra_1.0_arm64.deb"), "extra").unwrap();
    let remote_before = snapshot(&fx.remote);

    let report = recover(&fx.work).unwrap();

    assert_eq!(report.pending, vec!["focal-extra_1.0_arm64.deb"]);
    assert!(holding.join("focal-extra_1.0_arm64.deb").is_file());
    assert!(!fx
        .work
        .join(APT_TREE_DIR)
        .join("pool/main/focal-extra_1.0_arm64.deb")
        .exists());
    assert_eq!(snapshot(&fx.remote), remote_before);

    fx.publisher(None).publish(&fx.context(vec![])).unwrap();

    assert!(fx.remote.join("pool/main/focal-extra_1.0_arm64.deb").is_file());
    assert_eq!(
        listed_packages(&fx.read_remote("dists/focal/main/binary-arm64/Packages")),
        vec![
            "focal-baz_3.0_arm64.deb",
            "focal-docs_2.0_all.deb",
            "focal-extra_1.0_arm64.deb",
        ]
    );
    assert!(fs::read_dir(&holding).unwrap().next().is_none());
}

#[test]
fn recover_reports_conflicting_leftovers() {
    let fx = Fixture::new();
    fx.publisher(None).publish(&fx.context(vec![])).unwrap();
    let holding = fx.work.join(APT_HOLDING_DIR);
    fs::write(holding.join("focal-foo_1.1_amd64.deb"), "different bytes").unwrap();

    let err = recover(&fx.work).unwrap_err();

    assert_eq!(err.step, Step::Recover);
    assert!(format!("{:#}", err.source).contains("focal-foo_1.1_amd64.deb"));
    assert!(holding.join("focal-foo_1.1_amd64.deb").is_file());
}

#[test]
fn non_package_files_in_the_pool_are_not_indexed() {
    let fx = Fixture::new();
    fs::write(
        fx.remote.join("pool/main/focal-foo_1.1_amd64.buildinfo"),
        "Format: 1.0\n",
    )
    .unwrap();

    fx.publisher(None).publish(&fx.context(vec![])).unwrap();

    let amd64 = fx.read_remote("dists/focal/main/binary-amd64/Packages");
    assert_eq!(listed_packages(&amd64), vec!["focal-foo_1.1_amd64.deb"]);
    assert!(fx
        .remote
        .join("pool/main/focal-foo_1.1_amd64.buildinfo")
        .is_file());
}

#[test]
fn incoming_artifacts_are_admitted_and_indexed() {
    let fx = Fixture::new();
    let new_deb = fx.incoming.join("bullseye-bar_0.9~rc1_arm64.deb");
    fs::write(&new_deb, "bar").unwrap();

    let report = fx
        .publisher(None)
        .publish(&fx.context(vec![new_deb]))
        .unwrap();

    assert_eq!(report.admitted, vec!["bullseye-bar_0.9~rc1_arm64.deb"]);
    let arm64 = fx.read_remote("dists/bullseye/main/binary-arm64/Packages");
    assert_eq!(listed_packages(&arm64), vec!["bullseye-bar_0.9~rc1_arm64.deb"]);
    assert!(fx
        .read_remote("dists/bullseye/Release")
        .contains("Architectures: amd64,arm64\n"));
}

#[test]
fn untagged_or_conflicting_incoming_artifacts_are_rejected() {
    let fx = Fixture::new();
    let untagged = fx.incoming.join("foo_1.0_amd64.deb");
    fs::write(&untagged, "x").unwrap();
    let err = fx
        .publisher(None)
        .publish(&fx.context(vec![untagged]))
        .unwrap_err();
    assert_eq!(err.step, Step::Admit);

    let rebuilt = fx.incoming.join("focal-foo_1.1_amd64.deb");
    fs::write(&rebuilt, "rebuilt with different bytes").unwrap();
    let err = fx
        .publisher(None)
        .publish(&fx.context(vec![rebuilt]))
        .unwrap_err();
    assert_eq!(err.step, Step::Admit);
    assert!(format!("{:#}", err.source).contains("immutable"));
}

#[test]
fn concurrent_run_is_refused() {
    let fx = Fixture::new();
    let _held = RunLock::acquire(&fx.work.join(LOCK_FILE)).unwrap();

    let err = fx.publisher(None).publish(&fx.context(vec![])).unwrap_err();

    assert_eq!(err.step, Step::Lock);
    assert!(!fx.work.join(APT_TREE_DIR).exists());
}
