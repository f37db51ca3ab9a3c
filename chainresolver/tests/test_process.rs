use std::{error::Error, fs, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

use chainresolver::{GroupOutput, GroupStatus};

fn parse_lines(stdout: &[u8]) -> Vec<GroupOutput> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn share(group: &GroupOutput, id: &str) -> Option<f64> {
    group
        .intensities
        .iter()
        .find(|(k, _)| k.as_str() == id)
        .map(|(_, v)| *v)
}

#[test]
fn test_file_missing() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("chainresolver")?;

    cmd.arg("not_real.json").arg("-o").arg("-");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("NotFound"));
    Ok(())
}

#[test]
fn test_malformed_cutoff() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("chainresolver")?;

    cmd.arg("./tests/data/lipids.json").args(["-c", "1.5"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("must be in (0, 1]"));

    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.arg("./tests/data/lipids.json").args(["-c", "zero"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid float literal"));
    Ok(())
}

#[test]
fn test_run() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.env("RUST_LOG", "info");
    cmd.arg("./tests/data/lipids.json").args(["-o", "-", "-t", "2"]);
    let result = cmd.assert().success();
    let output = result.get_output();
    let groups = parse_lines(&output.stdout);
    assert_eq!(groups.len(), 3);

    let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["PC 34:1", "PE 36:2", "PI 38:4"]);

    let pc = &groups[0];
    assert_eq!(pc.status, GroupStatus::Resolved);
    assert_eq!(pc.intensities.len(), 2);
    assert!((share(pc, "PC 16:0_18:1").unwrap() - 0.7).abs() < 1e-6);
    assert!(share(pc, "PC 14:0_20:1").is_none());
    assert!((pc.intensities.values().sum::<f64>() - 1.0).abs() < 1e-6);
    assert_eq!(pc.rounds.len(), 2);
    assert!(pc.trace.is_none());

    let pe = &groups[1];
    assert_eq!(pe.status, GroupStatus::Failed);
    assert!(pe.intensities.is_empty());
    assert!(pe.error.as_ref().unwrap().contains("No chain combination"));

    let pi = &groups[2];
    assert_eq!(pi.intensities.len(), 1);
    assert_eq!(share(pi, "PI 18:0_20:4"), Some(1.0));

    result
        .stderr(predicate::str::contains("Groups: 3"))
        .stderr(predicate::str::contains("Resolved: 2 | Failed: 1"));
    Ok(())
}

#[test]
fn test_compressed_and_stdin_input() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.arg("./tests/data/lipids.json");
    let plain = cmd.assert().success().get_output().stdout.clone();

    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.arg("./tests/data/lipids.json.gz");
    let compressed = cmd.assert().success().get_output().stdout.clone();
    assert_eq!(plain, compressed);

    let mut cmd = assert_cmd::Command::cargo_bin("chainresolver")?;
    cmd.arg("-")
        .write_stdin(fs::read("./tests/data/lipids.json.gz")?);
    let streamed = cmd.assert().success().get_output().stdout.clone();
    assert_eq!(plain, streamed);
    Ok(())
}

#[test]
fn test_debug_trace() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.arg("./tests/data/lipids.json").args(["-d", "-c", "0.5"]);
    let result = cmd.assert().success();
    let groups = parse_lines(&result.get_output().stdout);

    let pc = &groups[0];
    assert_eq!(pc.rounds.len(), 3);
    assert_eq!(pc.intensities.len(), 1);
    let trace = pc.trace.as_ref().unwrap();
    let flagged: Vec<_> = trace
        .iter()
        .map(|r| (r.round, r.combination.as_str()))
        .collect();
    assert_eq!(
        flagged,
        vec![
            (1, "PC 14:0_20:1"),
            (1, "PC 16:1_18:0"),
            (2, "PC 16:1_18:0")
        ]
    );

    let pe = &groups[1];
    assert_eq!(pe.trace.as_ref().unwrap().len(), 1);
    assert!(String::from_utf8_lossy(&result.get_output().stdout)
        .contains(r#""reason":"MissingChainEvidence""#));
    Ok(())
}

#[test]
fn test_command_line_disables_configured_debug() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.arg("./tests/data/lipids.json")
        .args(["--config-file", "./tests/data/config.toml"]);
    let groups = parse_lines(&cmd.assert().success().get_output().stdout);
    assert!(groups.iter().all(|g| g.trace.is_some()));

    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.arg("./tests/data/lipids.json")
        .args(["--config-file", "./tests/data/config.toml", "--debug=false"]);
    let groups = parse_lines(&cmd.assert().success().get_output().stdout);
    assert_eq!(groups.len(), 3);
    assert!(groups.iter().all(|g| g.trace.is_none()));
    Ok(())
}

#[test]
fn test_environment_and_precedence() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.env("CHAINRESOLVER_RELATIVE_CHAIN_CUTOFF", "0.001")
        .arg("./tests/data/lipids.json");
    let groups = parse_lines(&cmd.assert().success().get_output().stdout);
    assert_eq!(groups[0].intensities.len(), 3);
    assert_eq!(groups[2].intensities.len(), 2);

    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.env("CHAINRESOLVER_RELATIVE_CHAIN_CUTOFF", "0.001")
        .arg("./tests/data/lipids.json")
        .args(["-c", "0.2"]);
    let groups = parse_lines(&cmd.assert().success().get_output().stdout);
    assert_eq!(groups[0].intensities.len(), 2);

    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.env("CHAINRESOLVER_RELATIVE_CHAIN_CUTOFF", "3.0")
        .arg("./tests/data/lipids.json");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("InvalidCutoff"));
    Ok(())
}

#[test]
fn test_unconstrained_solver() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("chainresolver")?;
    cmd.arg("./tests/data/lipids.json").args(["--solver", "lstsq"]);
    let groups = parse_lines(&cmd.assert().success().get_output().stdout);
    // The candidate columns are orthogonal so both solvers agree here
    assert!((share(&groups[0], "PC 16:0_18:1").unwrap() - 0.7).abs() < 1e-6);
    Ok(())
}
