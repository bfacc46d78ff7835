use std::{fmt::Write as _, fs, path::Path};

use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::tempdir;

/// Gable roof over [100, 110] x [200, 210], ridge along x = 105.
const GABLE_ROOF: &str = "\
v 100 200 5
v 100 210 5
v 105 200 8
v 105 210 8
v 110 200 5
v 110 210 5
f 1 3 4
f 1 4 2
f 3 5 6
f 3 6 4
";

fn write_lattice(path: &Path, from: [i32; 2], to: [i32; 2], z: f64) -> std::io::Result<()> {
    let mut text = String::new();
    for y in from[1]..=to[1] {
        for x in from[0]..=to[0] {
            let _ = writeln!(text, "{x} {y} {z}");
        }
    }
    fs::write(path, text)
}

#[test]
fn roof_writes_polygons_and_report() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let out_dir = dir.path().join("out");
    let first = dir.path().join("1001.obj");
    let second = dir.path().join("1002.obj");
    fs::write(&first, GABLE_ROOF)?;
    fs::write(&second, GABLE_ROOF)?;
    let report = dir.path().join("report.json");

    let mut cmd = cargo_bin_cmd!("roofgrid");
    cmd.arg("roof")
        .arg(&first)
        .arg(&second)
        .arg("--out-dir")
        .arg(&out_dir)
        .arg("--report")
        .arg(&report);
    cmd.assert().success();

    for stem in ["1001", "1002"] {
        let obj = fs::read_to_string(out_dir.join(format!("{stem}_poly.obj")))?;
        let faces: Vec<_> = obj.lines().filter(|l| l.starts_with("f ")).collect();
        assert_eq!(faces.len(), 2, "two roof planes expected for {stem}");
        assert!(faces.iter().all(|f| f.split_whitespace().count() == 5));
    }

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report)?)?;
    let entries = json.as_array().ok_or("report is not an array")?;
    assert_eq!(entries.len(), 2);
    for entry in entries {
        assert_eq!(entry["polygons"], 2);
        assert_eq!(entry["regions"], 2);
        assert_eq!(entry["strategy"], "exact");
    }
    Ok(())
}

#[test]
fn roof_hull_strategy_writes_beside_input() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("hall.obj");
    fs::write(&input, GABLE_ROOF)?;

    let mut cmd = cargo_bin_cmd!("roofgrid");
    cmd.arg("roof").arg(&input).arg("--strategy").arg("hull");
    cmd.assert().success();

    let obj = fs::read_to_string(dir.path().join("hall_poly.obj"))?;
    assert_eq!(obj.lines().filter(|l| l.starts_with("v ")).count(), 8);
    assert_eq!(obj.lines().filter(|l| l.starts_with("f ")).count(), 2);
    Ok(())
}

#[test]
fn missing_roof_input_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let mut cmd = cargo_bin_cmd!("roofgrid");
    cmd.arg("roof").arg(dir.path().join("absent.obj"));
    cmd.assert().failure();
    Ok(())
}

#[test]
fn grid_rasterizes_two_by_two() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let points = dir.path().join("points.xyz");
    fs::write(&points, "0 0 1\n1 0 2\n0 1 3\n1 1 4\n")?;
    let output = dir.path().join("grid.csv");
    let surface = dir.path().join("surface.obj");

    let mut cmd = cargo_bin_cmd!("roofgrid");
    cmd.arg("grid")
        .arg(&points)
        .arg("--center-x")
        .arg("0.5")
        .arg("--center-y")
        .arg("0.5")
        .arg("--size")
        .arg("2")
        .arg("--spacing")
        .arg("1")
        .arg("--output")
        .arg(&output)
        .arg("--surface")
        .arg(&surface);
    cmd.assert().success();

    assert_eq!(fs::read_to_string(&output)?, "1.00,2.00\n3.00,4.00\n");
    let obj = fs::read_to_string(&surface)?;
    assert_eq!(obj.lines().filter(|l| l.starts_with("f ")).count(), 1);
    Ok(())
}

#[test]
fn config_file_supplies_grid_settings() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let points = dir.path().join("points.xyz");
    fs::write(&points, "0 0 1\n1 0 2\n0 1 3\n1 1 4\n")?;
    let config = dir.path().join("config.json");
    fs::write(&config, r#"{"grid": {"size": 2.0, "spacing": 1.0}}"#)?;
    let output = dir.path().join("grid.csv");

    let mut cmd = cargo_bin_cmd!("roofgrid");
    cmd.arg("--config")
        .arg(&config)
        .arg("grid")
        .arg(&points)
        .arg("--center-x")
        .arg("0.5")
        .arg("--center-y")
        .arg("0.5")
        .arg("-o")
        .arg(&output);
    cmd.assert().success();

    assert_eq!(fs::read_to_string(&output)?, "1.00,2.00\n3.00,4.00\n");
    Ok(())
}

#[test]
fn sample_writes_all_outputs() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let roof = dir.path().join("roof.obj");
    fs::write(&roof, GABLE_ROOF)?;
    let points = dir.path().join("surroundings.xyz");
    write_lattice(&points, [95, 195], [114, 214], 2.0)?;
    let out_dir = dir.path().join("sample");

    let mut cmd = cargo_bin_cmd!("roofgrid");
    cmd.arg("sample")
        .arg("--roof")
        .arg(&roof)
        .arg("--points")
        .arg(&points)
        .arg("--out-dir")
        .arg(&out_dir)
        .arg("--size")
        .arg("20")
        .arg("--spacing")
        .arg("1");
    cmd.assert().success();

    for name in [
        "roof.obj",
        "surroundings2D.csv",
        "surroundings3D.obj",
        "mask.csv",
        "report.json",
    ] {
        assert!(out_dir.join(name).is_file(), "{name} missing");
    }

    let grid = fs::read_to_string(out_dir.join("surroundings2D.csv"))?;
    assert_eq!(grid.lines().count(), 20);
    assert!(grid.lines().all(|l| l.split(',').all(|v| v == "2.00")));

    let mask = fs::read_to_string(out_dir.join("mask.csv"))?;
    let ones = mask.split([',', '\n']).filter(|v| *v == "1").count();
    assert_eq!(ones, 121);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out_dir.join("report.json"))?)?;
    assert_eq!(json["label"], "100_200_110_210");
    assert_eq!(json["masked_cells"], 121);
    assert_eq!(json["grid"]["rows"], 20);
    assert_eq!(json["roof"]["regions"], 2);
    Ok(())
}

#[test]
fn sample_skips_oversized_building() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let roof = dir.path().join("roof.obj");
    fs::write(&roof, GABLE_ROOF)?;
    let points = dir.path().join("surroundings.xyz");
    write_lattice(&points, [95, 195], [114, 214], 2.0)?;
    let out_dir = dir.path().join("sample");

    let mut cmd = cargo_bin_cmd!("roofgrid");
    cmd.arg("sample")
        .arg("--roof")
        .arg(&roof)
        .arg("--points")
        .arg(&points)
        .arg("--out-dir")
        .arg(&out_dir)
        .arg("--max-size")
        .arg("8");
    cmd.assert().success();

    assert!(!out_dir.join("mask.csv").exists());
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out_dir.join("report.json"))?)?;
    assert!(json["skipped"].is_string());
    Ok(())
}
