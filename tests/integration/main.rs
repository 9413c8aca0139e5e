//! Integration tests for kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// A kiln command isolated from the user's configuration and environment
    fn kiln(home: &Path) -> Command {
        let config = home.join("config.toml");
        if !config.exists() {
            let store = home.join("store");
            fs::write(
                &config,
                format!("[store]\npath = {:?}\n", store.display().to_string()),
            )
            .unwrap();
        }
        let mut cmd = cargo_bin_cmd!("kiln");
        cmd.env("KILN_CONFIG", &config)
            .env_remove("NO_CACHE")
            .env_remove("NO_TTY")
            .env_remove("KILN_OMIT")
            .env_remove("KILN_ENGINE")
            .env_remove("KILN_DEBUG")
            .env_remove("RUST_LOG")
            .args(["--engine", "memory", "--quiet"]);
        cmd
    }

    fn image_id() -> impl Predicate<str> {
        predicate::str::is_match("^[0-9a-f]{64}\n$").unwrap()
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("kiln")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("cache-keyed container image builder"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("kiln")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn build_prints_image_id() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("web.kiln");
        fs::write(&script, "from \"debian\"\nrun \"make\"\nuser \"nobody\"\n").unwrap();

        kiln(temp.path())
            .arg("build")
            .arg(&script)
            .assert()
            .success()
            .stdout(image_id());
    }

    #[test]
    fn build_reads_stdin() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .arg("build")
            .write_stdin("from \"debian\"\nenv PATH: \"/usr/bin\"\n")
            .assert()
            .success()
            .stdout(image_id());
    }

    #[test]
    fn build_uses_vars() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .args(["build", "-", "--var", "app=web"])
            .write_stdin("from \"debian\"\nworkdir \"/srv/#{var \"app\"}\"\n")
            .assert()
            .success();

        kiln(temp.path())
            .args(["build", "-"])
            .write_stdin("from \"debian\"\nworkdir \"/srv/#{var \"app\"}\"\n")
            .assert()
            .failure()
            .stderr(predicate::str::contains("value for key \"app\" does not exist"));
    }

    #[test]
    fn failing_run_names_the_step() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .arg("build")
            .write_stdin("from \"debian\"\n\nrun \"exit 3\"\n")
            .assert()
            .failure()
            .stderr(predicate::str::contains("run (line 3)"))
            .stderr(predicate::str::contains("exited with code 3"));
    }

    #[test]
    fn omitted_verbs_are_unknown() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .args(["build", "--omit", "run"])
            .write_stdin("from \"debian\"\nrun \"make\"\n")
            .assert()
            .failure()
            .stderr(predicate::str::contains("undefined verb or function"));
    }

    #[test]
    fn omit_from_environment() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .env("KILN_OMIT", "getenv")
            .arg("build")
            .write_stdin("from \"debian\"\nuser getenv(\"USER\")\n")
            .assert()
            .failure()
            .stderr(predicate::str::contains("undefined verb or function"));
    }

    #[test]
    fn parse_errors_report_line() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .arg("build")
            .write_stdin("from \"debian\"\nskip do\n  run \"x\"\n")
            .assert()
            .failure()
            .stderr(predicate::str::contains("parse error on line"))
            .stderr(predicate::str::contains("missing `end`"));
    }

    #[test]
    fn multi_reports_every_result() {
        let temp = TempDir::new().unwrap();
        let good = temp.path().join("good.kiln");
        let bad = temp.path().join("bad.kiln");
        fs::write(&good, "from \"debian\"\nrun \"make\"\n").unwrap();
        fs::write(&bad, "from \"debian\"\nrun \"false\"\n").unwrap();

        kiln(temp.path())
            .arg("multi")
            .arg(&good)
            .arg(&bad)
            .assert()
            .failure()
            .stdout(predicate::str::contains("good.kiln"))
            .stderr(predicate::str::contains("bad.kiln"))
            .stderr(predicate::str::contains("some builds contained errors"));
    }

    #[test]
    fn repl_evaluates_incrementally() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .arg("repl")
            .write_stdin("from \"debian\"\nbogus\ngetuid \"nobody\"\nskip do\n  run \"x\"\nend\nquit\nrun \"never\"\n")
            .assert()
            .success()
            .stdout(predicate::str::contains("65534"))
            .stderr(predicate::str::contains("undefined verb or function"));
    }

    #[test]
    fn saved_image_round_trips_through_store() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("web.kiln");
        fs::write(
            &script,
            "from \"debian\"\nrun \"make\"\nsave file: \"web.tar\"\n",
        )
        .unwrap();

        kiln(temp.path()).arg("build").arg(&script).assert().success();
        assert!(temp.path().join("web.tar").exists());

        kiln(temp.path())
            .args(["store", "import"])
            .arg(temp.path().join("web.tar"))
            .args(["--tag", "web"])
            .assert()
            .success();

        kiln(temp.path())
            .args(["store", "tags"])
            .assert()
            .success()
            .stdout(predicate::str::contains("web"));

        let out = temp.path().join("web-oci.tar");
        kiln(temp.path())
            .args(["store", "export", "web", "--format", "oci", "--out"])
            .arg(&out)
            .assert()
            .success();
        assert!(out.exists());
    }

    #[test]
    fn store_export_missing_tag() {
        let temp = TempDir::new().unwrap();
        kiln(temp.path())
            .args(["store", "export", "nope", "--out"])
            .arg(temp.path().join("x.tar"))
            .assert()
            .failure();
    }

    #[test]
    fn invalid_config_is_reported() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("config.toml"), "[build]\ncache = \"maybe\"\n").unwrap();
        kiln(temp.path())
            .args(["store", "tags"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}
