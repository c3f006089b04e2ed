//! Integration tests for the manubuild CLI

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    /// Command rooted in `dir`, isolated from any user or CI configuration
    fn manubuild(dir: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("manubuild");
        cmd.current_dir(dir)
            .env_remove("CI")
            .env_remove("RUST_LOG")
            .env("MANUBUILD_BRANCH", "main")
            .arg("--no-local")
            .arg("-c")
            .arg(dir.join("global.toml"));
        cmd
    }

    fn write_rules(dir: &Path, json: &str) {
        std::fs::write(dir.join("rules.json"), json).unwrap();
    }

    const CHAIN: &str = r#"[
        {"id": "gen", "inputs": ["in.txt"], "outputs": ["gen.txt"], "specHash": "g1",
         "command": "echo run >> runs.log; cat in.txt > gen.txt"},
        {"id": "paper", "inputs": ["gen.txt"], "outputs": ["paper.txt"], "specHash": "p1",
         "command": "cat gen.txt gen.txt > paper.txt"}
    ]"#;

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        manubuild(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("incremental builds"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        manubuild(dir.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("manubuild"));
    }

    #[test]
    fn config_path() {
        let dir = TempDir::new().unwrap();
        manubuild(dir.path())
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("global.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        manubuild(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"));
    }

    #[test]
    fn config_init_writes_file() {
        let dir = TempDir::new().unwrap();
        manubuild(dir.path())
            .args(["config", "init"])
            .assert()
            .success();
        let written = std::fs::read_to_string(dir.path().join("global.toml")).unwrap();
        assert!(written.contains("[build]"));
    }

    #[test]
    fn build_then_rebuild_uses_cache() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("in.txt"), "x").unwrap();
        write_rules(dir.path(), CHAIN);

        manubuild(dir.path())
            .arg("build")
            .assert()
            .success()
            .stdout(predicate::str::contains("DONE"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("paper.txt")).unwrap(),
            "xx"
        );

        manubuild(dir.path())
            .arg("build")
            .assert()
            .success()
            .stdout(predicate::str::contains("CACHED").and(predicate::str::contains("DONE").not()));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("runs.log")).unwrap(),
            "run\n"
        );
    }

    #[test]
    fn failing_rule_blocks_dependents() {
        let dir = TempDir::new().unwrap();
        write_rules(
            dir.path(),
            r#"[
                {"id": "broken", "outputs": ["a.txt"], "specHash": "1", "command": "exit 2"},
                {"id": "after", "inputs": ["a.txt"], "outputs": ["b.txt"], "specHash": "2",
                 "command": "cp a.txt b.txt"}
            ]"#,
        );

        manubuild(dir.path())
            .arg("build")
            .assert()
            .code(1)
            .stdout(predicate::str::contains("FAILED").and(predicate::str::contains("BLOCKED")));
    }

    #[test]
    fn missing_input_is_reported() {
        let dir = TempDir::new().unwrap();
        write_rules(
            dir.path(),
            r#"[{"id": "fig", "inputs": ["absent.csv"], "outputs": ["fig.txt"], "specHash": "1"}]"#,
        );

        manubuild(dir.path())
            .arg("build")
            .assert()
            .failure()
            .stderr(predicate::str::contains("absent.csv"));
    }

    #[test]
    fn cycle_is_reported() {
        let dir = TempDir::new().unwrap();
        write_rules(
            dir.path(),
            r#"[
                {"id": "x", "inputs": ["y.txt"], "outputs": ["x.txt"], "specHash": "1"},
                {"id": "y", "inputs": ["x.txt"], "outputs": ["y.txt"], "specHash": "2"}
            ]"#,
        );

        manubuild(dir.path())
            .arg("plan")
            .assert()
            .failure()
            .stderr(predicate::str::contains("cycle"));
    }

    #[test]
    fn plan_prints_dot() {
        let dir = TempDir::new().unwrap();
        write_rules(dir.path(), CHAIN);

        manubuild(dir.path())
            .args(["plan", "--dot"])
            .assert()
            .success()
            .stdout(predicate::str::contains("digraph").and(predicate::str::contains("paper")));
    }

    #[test]
    fn plan_does_not_run_rules() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("in.txt"), "x").unwrap();
        write_rules(dir.path(), CHAIN);

        manubuild(dir.path())
            .arg("plan")
            .assert()
            .success()
            .stdout(predicate::str::contains("STALE"));
        assert!(!dir.path().join("gen.txt").exists());
    }

    #[test]
    fn build_writes_report() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("in.txt"), "x").unwrap();
        write_rules(dir.path(), CHAIN);

        manubuild(dir.path())
            .args(["build", "--report", "out/report.json"])
            .assert()
            .success();

        let report: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("out/report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(report["rules"][0]["id"], "gen");
        assert_eq!(report["rules"][1]["state"], "DONE");
    }

    #[test]
    fn clean_removes_outputs_and_cache() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("in.txt"), "x").unwrap();
        write_rules(dir.path(), CHAIN);
        manubuild(dir.path()).arg("build").assert().success();
        assert!(dir.path().join(".manubuild/cache").exists());

        manubuild(dir.path())
            .args(["clean", "--all"])
            .assert()
            .success()
            .stdout(
                predicate::str::contains("Removed 2 output file(s)")
                    .and(predicate::str::contains("Cache: ")),
            );
        assert!(!dir.path().join("paper.txt").exists());
        assert!(!dir.path().join(".manubuild/cache").exists());
        assert!(dir.path().join("in.txt").exists());
    }

    #[test]
    fn datasets_without_declarations() {
        let dir = TempDir::new().unwrap();
        manubuild(dir.path())
            .arg("datasets")
            .assert()
            .success()
            .stdout(predicate::str::contains("No datasets declared"));
    }
}
