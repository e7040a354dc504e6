//! Integration tests for strata

#[cfg(unix)]
mod pipeline_tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use strata::base::{BaseProvider, StaticBaseProvider};
    use strata::builder::{BuildEvent, BuildOutcome, Builder, StepStatus};
    use strata::cache::MemoryCache;
    use strata::descriptor::BuildDescriptor;
    use strata::image::ImageStore;
    use strata::launcher::{ExitOutcome, LaunchOptions, Launcher};
    use strata::layer::{Entry, LayerDelta};
    use strata::sandbox::{Isolation, StdioMode};
    use strata::StrataError;
    use tempfile::TempDir;

    const APP_STRATAFILE: &str = r#"
# dependencies first, sources last
FROM base:v1
WORKDIR /app
COPY manifest .
RUN ["install-deps"]
COPY ** .
CMD ["run-entry"]
"#;

    fn base_provider() -> Arc<dyn BaseProvider> {
        let mut delta = LayerDelta::new();
        delta.insert(
            "bin/install-deps",
            Entry::file(0o755, "#!/bin/sh\ncat manifest > deps.lock\n"),
        );
        delta.insert(
            "bin/run-entry",
            Entry::file(0o755, "#!/bin/sh\necho running\n"),
        );
        Arc::new(StaticBaseProvider::new().with("base:v1", delta).unwrap())
    }

    fn app_context() -> TempDir {
        let ctx = TempDir::new().unwrap();
        fs::write(ctx.path().join("manifest"), "left-pad = 1.0\n").unwrap();
        fs::create_dir_all(ctx.path().join("src")).unwrap();
        fs::write(ctx.path().join("src/main.txt"), "v1").unwrap();
        ctx
    }

    fn statuses(outcome: &BuildOutcome) -> Vec<StepStatus> {
        outcome.steps.iter().map(|s| s.status).collect()
    }

    async fn build(builder: &Builder, text: &str, ctx: &Path) -> BuildOutcome {
        let descriptor = BuildDescriptor::parse(text).unwrap();
        builder.build(&descriptor, ctx).await.unwrap()
    }

    fn cached_builder(work: &TempDir) -> (Builder, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let builder = Builder::new(base_provider())
            .with_cache(cache.clone())
            .with_work_dir(work.path());
        (builder, cache)
    }

    #[tokio::test]
    async fn rebuild_of_unchanged_context_is_fully_cached() {
        let ctx = app_context();
        let work = TempDir::new().unwrap();
        let (builder, _) = cached_builder(&work);

        let first = build(&builder, APP_STRATAFILE, ctx.path()).await;
        let second = build(&builder, APP_STRATAFILE, ctx.path()).await;

        assert_eq!(first.built(), 3);
        assert_eq!(second.built(), 0);
        assert_eq!(second.cache_hits(), 3);
        assert_eq!(first.image.chain_digest(), second.image.chain_digest());
        assert_eq!(first.image.id, second.image.id);
    }

    #[tokio::test]
    async fn source_change_only_rebuilds_later_copy() {
        let ctx = app_context();
        let work = TempDir::new().unwrap();
        let (builder, _) = cached_builder(&work);

        let first = build(&builder, APP_STRATAFILE, ctx.path()).await;
        fs::write(ctx.path().join("src/main.txt"), "v2").unwrap();
        let second = build(&builder, APP_STRATAFILE, ctx.path()).await;

        assert_eq!(
            statuses(&second),
            vec![
                StepStatus::Base,
                StepStatus::Metadata,
                StepStatus::CacheHit,
                StepStatus::CacheHit,
                StepStatus::Built,
                StepStatus::Metadata,
            ]
        );
        assert_eq!(&first.image.chain.ids()[..3], &second.image.chain.ids()[..3]);
        assert_ne!(first.image.id, second.image.id);

        let view = second.image.view();
        match view.get("app/deps.lock") {
            Some(Entry::File { content, .. }) => assert_eq!(&content[..], b"left-pad = 1.0\n"),
            other => panic!("unexpected entry {:?}", other),
        }
        match view.get("app/src/main.txt") {
            Some(Entry::File { content, .. }) => assert_eq!(&content[..], b"v2"),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[tokio::test]
    async fn early_change_invalidates_every_later_step() {
        let ctx = TempDir::new().unwrap();
        fs::write(ctx.path().join("a.txt"), "a1").unwrap();
        fs::write(ctx.path().join("b.txt"), "b").unwrap();
        let work = TempDir::new().unwrap();
        let (builder, _) = cached_builder(&work);
        let text = "FROM base:v1\nCOPY a.txt /one/\nCOPY b.txt /two/";

        build(&builder, text, ctx.path()).await;
        fs::write(ctx.path().join("a.txt"), "a2").unwrap();
        let second = build(&builder, text, ctx.path()).await;

        // b.txt is unchanged, but its parent is not
        assert_eq!(
            statuses(&second),
            vec![StepStatus::Base, StepStatus::Built, StepStatus::Built]
        );
    }

    #[tokio::test]
    async fn failing_run_aborts_without_caching() {
        let ctx = app_context();
        let work = TempDir::new().unwrap();
        let (builder, cache) = cached_builder(&work);
        let descriptor = BuildDescriptor::parse(
            "FROM base:v1\nCOPY manifest /app/\nRUN echo broken >&2; exit 4\nCMD [\"run-entry\"]",
        )
        .unwrap();

        let err = builder.build(&descriptor, ctx.path()).await.unwrap_err();

        assert_eq!(err.failed_step(), Some(3));
        match err.cause() {
            StrataError::CommandExecution { code, output, .. } => {
                assert_eq!(*code, 4);
                assert_eq!(output, "broken");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(cache.len(), 1, "only the COPY layer may be cached");
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn launch_runs_default_command_in_working_dir() {
        let ctx = app_context();
        let work = TempDir::new().unwrap();
        let containers = TempDir::new().unwrap();
        let image = build(
            &Builder::new(base_provider()).with_work_dir(work.path()),
            "FROM base:v1\nWORKDIR /app\nCOPY manifest .\nCMD [\"/bin/sh\", \"-c\", \"pwd; cat manifest\"]",
            ctx.path(),
        )
        .await
        .image;

        let launcher = Launcher::new(containers.path(), Isolation::None);
        let container = launcher
            .launch(
                &image,
                LaunchOptions {
                    stdio: StdioMode::Piped,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let output = container.wait_with_output().await.unwrap();

        assert!(output.outcome.success());
        let stdout = String::from_utf8(output.stdout).unwrap();
        let mut lines = stdout.lines();
        assert!(lines.next().unwrap().ends_with("rootfs/app"));
        assert_eq!(lines.next(), Some("left-pad = 1.0"));
        assert_eq!(fs::read_dir(containers.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn launch_override_replaces_default_command() {
        let ctx = app_context();
        let work = TempDir::new().unwrap();
        let containers = TempDir::new().unwrap();
        let image = build(
            &Builder::new(base_provider()).with_work_dir(work.path()),
            APP_STRATAFILE,
            ctx.path(),
        )
        .await
        .image;

        let launcher = Launcher::new(containers.path(), Isolation::None);
        let container = launcher
            .launch(
                &image,
                LaunchOptions {
                    command: Some(vec!["/bin/sh".into(), "-c".into(), "echo override".into()]),
                    stdio: StdioMode::Piped,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let output = container.wait_with_output().await.unwrap();
        assert_eq!(String::from_utf8(output.stdout).unwrap(), "override\n");
    }

    #[tokio::test]
    async fn exit_code_is_propagated() {
        let ctx = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let containers = TempDir::new().unwrap();
        let image = build(
            &Builder::new(base_provider()).with_work_dir(work.path()),
            "FROM scratch\nCMD exit 42",
            ctx.path(),
        )
        .await
        .image;

        let mut container = Launcher::new(containers.path(), Isolation::None)
            .launch(&image, LaunchOptions::default())
            .await
            .unwrap();
        let outcome = container.wait().await.unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(42));
        assert_eq!(outcome.code(), 42);
    }

    #[tokio::test]
    async fn killed_container_reports_signal() {
        let ctx = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let containers = TempDir::new().unwrap();
        let image = build(
            &Builder::new(base_provider()).with_work_dir(work.path()),
            "FROM scratch\nCMD [\"/bin/sh\", \"-c\", \"sleep 30\"]",
            ctx.path(),
        )
        .await
        .image;

        let mut container = Launcher::new(containers.path(), Isolation::None)
            .launch(&image, LaunchOptions::default())
            .await
            .unwrap();
        let outcome = container.kill().await.unwrap();
        assert_eq!(outcome, ExitOutcome::Signaled(libc::SIGKILL));
        assert_eq!(outcome.code(), 128 + libc::SIGKILL);
    }

    #[tokio::test]
    async fn run_on_scratch_base() {
        let ctx = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let outcome = build(
            &Builder::new(base_provider()).with_work_dir(work.path()),
            "FROM scratch\nWORKDIR /out\nRUN echo hello > greeting.txt",
            ctx.path(),
        )
        .await;

        match outcome.image.view().get("out/greeting.txt") {
            Some(Entry::File { content, .. }) => assert_eq!(&content[..], b"hello\n"),
            other => panic!("unexpected entry {:?}", other),
        }
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn run_with_binary_and_bulky_output_completes() {
        let ctx = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let builder = Builder::new(base_provider()).with_work_dir(work.path());
        let descriptor = BuildDescriptor::parse(
            "FROM base:v1\nRUN printf 'ok\\377\\n'; head -c 300000 /dev/zero | tr '\\0' a; echo; echo done > done.txt",
        )
        .unwrap();
        let lines = parking_lot::Mutex::new(Vec::new());

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            builder.build_with_progress(&descriptor, ctx.path(), &|event| {
                if let BuildEvent::Output(line) = event {
                    lines.lock().push(line);
                }
            }),
        )
        .await
        .expect("build did not finish")
        .unwrap();

        let lines = lines.into_inner();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "ok\u{FFFD}");
        assert_eq!(lines[1].len(), 300000);
        assert!(outcome.image.view().get("done.txt").is_some());
    }

    #[tokio::test]
    async fn uncached_rebuild_saves_its_own_content() {
        let ctx = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let input = data.path().join("input.txt");
        let store = ImageStore::open(data.path().join("images")).unwrap();
        let builder = Builder::new(base_provider()).with_work_dir(work.path());
        // the RUN reads a host file, so its cache key ignores the change
        let text = format!(
            "FROM base:v1\nRUN cat {} > out.txt\nCMD [\"run-entry\"]",
            input.display()
        );
        let tag = strata::base::BaseRef::parse("gen:v1").unwrap();

        fs::write(&input, "first").unwrap();
        let first = build(&builder, &text, ctx.path()).await;
        store.save(&first.image, &[tag.clone()]).unwrap();

        fs::write(&input, "second").unwrap();
        let second = build(&builder, &text, ctx.path()).await;
        store.save(&second.image, &[tag]).unwrap();

        assert_eq!(first.image.chain.ids(), second.image.chain.ids());
        assert_ne!(first.image.id, second.image.id);

        let loaded = store.get("gen:v1").unwrap();
        match loaded.view().get("out.txt") {
            Some(Entry::File { content, .. }) => assert_eq!(&content[..], b"second"),
            other => panic!("unexpected entry {:?}", other),
        }
        let earlier = store.load(&first.image.id).unwrap();
        match earlier.view().get("out.txt") {
            Some(Entry::File { content, .. }) => assert_eq!(&content[..], b"first"),
            other => panic!("unexpected entry {:?}", other),
        }
    }
}

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    /// Binary with config and state isolated under `home`
    fn strata(home: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("strata");
        cmd.current_dir(home.path())
            .env("STRATA_CONFIG", home.path().join("config.toml"))
            .env("STRATA_DATA_DIR", home.path().join("data"))
            .arg("--no-local");
        cmd
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("layered image builds"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }

    #[test]
    fn images_empty() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args(["images", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn config_path_honours_env() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_set_then_show() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args(["config", "set", "cache.mode", "memory"])
            .assert()
            .success();
        strata(&home)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("mode = \"memory\""));
    }

    #[test]
    fn config_set_rejects_bad_value() {
        let home = TempDir::new().unwrap();
        strata(&home)
            .args(["config", "set", "cache.mode", "tape"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid cache mode"));
    }

    #[test]
    fn unknown_instruction_fails_build() {
        let home = TempDir::new().unwrap();
        let ctx = home.path().join("ctx");
        fs::create_dir_all(&ctx).unwrap();
        fs::write(ctx.join("Stratafile"), "FROM scratch\nADD x /\n").unwrap();

        strata(&home)
            .args(["build", "-q"])
            .arg(&ctx)
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown instruction 'ADD'"));
    }

    #[test]
    fn missing_base_fails_build() {
        let home = TempDir::new().unwrap();
        let ctx = home.path().join("ctx");
        fs::create_dir_all(&ctx).unwrap();
        fs::write(ctx.join("Stratafile"), "FROM nowhere:v1\n").unwrap();

        strata(&home)
            .args(["build", "-q"])
            .arg(&ctx)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Step 1"));
    }

    #[cfg(unix)]
    #[test]
    fn build_tag_and_run() {
        let home = TempDir::new().unwrap();
        let ctx = home.path().join("ctx");
        fs::create_dir_all(&ctx).unwrap();
        fs::write(ctx.join("greeting.txt"), "hello\n").unwrap();
        fs::write(
            ctx.join("Stratafile"),
            "FROM scratch\nWORKDIR /srv\nCOPY greeting.txt .\nCMD [\"/bin/sh\", \"-c\", \"cat greeting.txt; exit 7\"]\n",
        )
        .unwrap();

        strata(&home)
            .args(["build", "-q", "-t", "hello:v1"])
            .arg(&ctx)
            .assert()
            .success()
            .stdout(predicate::str::starts_with("sha256:"));

        strata(&home)
            .args(["images", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("sha256:"));

        strata(&home)
            .args(["run", "hello:v1"])
            .assert()
            .code(7)
            .stdout(predicate::str::contains("hello"));

        strata(&home)
            .args(["run", "hello:v1", "--", "/bin/sh", "-c", "exit 0"])
            .assert()
            .success();

        // Unchanged context: every layer comes from the on-disk cache
        strata(&home)
            .arg("build")
            .arg(&ctx)
            .assert()
            .success()
            .stdout(predicate::str::contains("CACHED"));

        strata(&home)
            .args(["rmi", "hello:v1"])
            .assert()
            .success();
        strata(&home)
            .args(["run", "hello:v1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("strata images"));
    }
}
