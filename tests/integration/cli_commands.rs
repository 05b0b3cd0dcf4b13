//! Runs the `hostform` binary against a state-file host in an isolated
//! XDG environment and checks output and exit codes.

use super::test_utils::{stderr, stdout, workstation_fixture, HostformEnv};

#[test]
fn test_validate_reports_counts() {
    let env = HostformEnv::new();
    env.write_descriptor(&workstation_fixture());

    let output = env.run(&["validate"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("Descriptor is valid"));
    assert!(text.contains("Services: 2"));
    assert!(text.contains("Packages: 4"));
}

#[test]
fn test_parse_and_validation_errors_have_distinct_exit_codes() {
    let env = HostformEnv::new();

    env.write_descriptor("[services\nbroken");
    let output = env.run(&["validate"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("Parse error"));

    env.write_descriptor("[services.ollama]\npackage = \"ollama\"\n");
    let output = env.run(&["validate"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("undefined package 'ollama'"));

    let output = env.run(&["--descriptor", "missing.toml", "validate"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_apply_list_show_and_rollback() {
    let env = HostformEnv::new();
    env.write_descriptor(&workstation_fixture());

    let output = env.run(&["apply"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Generation 1 committed"));
    let image = env.host_image();
    assert!(image["packages"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p == "ollama"));

    let output = env.run(&["apply"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("already converged"));

    env.write_descriptor("packages = [\"git\"]\n");
    let output = env.run(&["apply"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Generation 2 committed"));

    let output = env.run(&["list-generations", "--format", "json"]);
    assert!(output.status.success());
    let listed: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(listed["active"], 2);
    let ids: Vec<u64> = listed["generations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![2, 1]);

    let output = env.run(&["show", "1"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("Generation 1"));
    assert!(text.contains("enable-service ollama"));

    let output = env.run(&["rollback", "1"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Generation 3 committed (rollback to 1)"));
    let image = env.host_image();
    assert_eq!(image["services"]["ollama"]["enabled"], true);
    assert_eq!(image["environment"]["EDITOR"], "nvim");

    let output = env.run(&["list-generations", "--limit", "1"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("rollback to 1"));
}

#[test]
fn test_diff_json_does_not_touch_host() {
    let env = HostformEnv::new();
    env.write_descriptor(
        "packages = [\"ollama\"]\n\n[services.ollama]\npackage = \"ollama\"\n\n[services.ollama.settings]\nhost = \"0.0.0.0\"\n",
    );

    let output = env.run(&["diff", "--format", "json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let plan: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let kinds: Vec<&str> = plan["actions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["install", "enable-service", "set-config"]);
    assert!(plan["active_generation"].is_null());
    assert!(!env.host_image_path().exists());
}

#[test]
fn test_unknown_generation_exit_code() {
    let env = HostformEnv::new();
    env.write_descriptor("packages = [\"git\"]\n");

    let output = env.run(&["rollback", "7"]);
    assert_eq!(output.status.code(), Some(9));
    assert!(stderr(&output).contains("Generation 7 not found"));

    let output = env.run(&["show", "7"]);
    assert_eq!(output.status.code(), Some(9));
}

#[test]
fn test_failed_action_reports_applied_and_pending() {
    let env = HostformEnv::new();
    env.write_descriptor("packages = [\"git\"]\n\n[environment]\nEDITOR = \"nvim\"\n");
    // A directory where the host image's temp file goes makes every write fail
    // while reads still see an empty host.
    let image = env.host_image_path();
    let blocker = image.with_file_name(".host.json.tmp");
    std::fs::create_dir_all(&blocker).unwrap();

    let output = env.run(&["apply"]);
    assert_eq!(output.status.code(), Some(4), "stderr: {}", stderr(&output));
    let err = stderr(&output);
    assert!(err.contains("Recorded as run-"));
    assert!(err.contains("Applied (0):"));
    assert!(err.contains("Not applied (2):"));
    assert!(err.contains("! install git  (failed)"));

    let output = env.run(&["runs", "--format", "json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let runs: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(runs.as_array().unwrap().len(), 1);
    assert_eq!(runs[0]["outcome"], "failed");

    let output = env.run(&["list-generations"]);
    assert!(stdout(&output).contains("No generations recorded"));

    std::fs::remove_dir(&blocker).unwrap();
    let output = env.run(&["apply"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Generation 1 committed"));
}

#[test]
fn test_gc_keeps_newest_generations() {
    let env = HostformEnv::new();
    for packages in ["[\"git\"]", "[\"htop\"]", "[\"tmux\"]"] {
        env.write_descriptor(&format!("packages = {}\n", packages));
        let output = env.run(&["apply"]);
        assert!(output.status.success(), "stderr: {}", stderr(&output));
    }

    let output = env.run(&["rollback", "1"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let output = env.run(&["gc", "--keep", "2", "--force"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Removed 2 generation(s): 1, 2"));

    let output = env.run(&["list-generations", "--format", "json"]);
    let listed: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(listed["generations"].as_array().unwrap().len(), 2);
    assert_eq!(listed["active"], 4);
}

#[test]
fn test_invalid_config_exit_code() {
    let env = HostformEnv::new();
    env.write_descriptor("packages = [\"git\"]\n");
    let output = env
        .command()
        .args(["--quiet", "validate"])
        .env("HOSTFORM__RECONCILE__WATCHDOG_SECS", "0")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(8));
    assert!(stderr(&output).contains("watchdog_secs"));
}
