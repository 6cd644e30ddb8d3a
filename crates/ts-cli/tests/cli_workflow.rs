use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const DETECTOR_ROWS: usize = 51;
const SAMPLES: usize = 801;

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ts-analysis"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("ts-analysis should run")
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

/// Tab-delimited frame whose rows all carry a Gaussian line at 532 nm over a dark level.
fn write_frame(path: &Path, line_height: f64, dark: f64) {
    let mut content = String::new();
    for sample in 0..SAMPLES {
        let wavelength = 530.0 + sample as f64 * 0.005;
        let x = (wavelength - 532.0) / 0.02;
        let line = line_height * (-0.5 * x * x).exp();
        content.push_str(&format!("{wavelength}"));
        for _ in 0..DETECTOR_ROWS {
            content.push_str(&format!("\t{}", dark + line));
        }
        content.push('\n');
    }
    fs::write(path, content).expect("frame should be written");
}

fn write_config(root: &Path, mass_number: f64) -> std::path::PathBuf {
    write_frame(&root.join("s0500_02.asc"), 30.0, 100.0);
    write_frame(&root.join("bkgd_01.asc"), 60.0, 100.0);
    fs::create_dir_all(root.join("zte")).expect("table dir");
    fs::write(
        root.join("zte").join("zb_C.dat"),
        "h\nh\nh\nh\n1 1.0\n10 3.0\n100 5.5\n1000 6.0\n",
    )
    .expect("table should be written");

    let config = json!({
        "input": {"shot": "s0500_02.asc", "backgrounds": ["bkgd_01.asc"]},
        "edges": {"spacing": 10.0, "offset": 0.0},
        "split": {"discard_rows": 1},
        "window": {"lower": 0, "upper": SAMPLES},
        "angles": {"set_a": [30.0, 60.0, 90.0], "set_b": [120.0, 150.0]},
        "fit": {
            "fibres": ["3A"],
            "parameters": {
                "model": "doppler_ion",
                "n_e": [1.0e23, true],
                "T_e": [100.0, true],
                "V_fe": [0.0, true],
                "A": [mass_number, true],
                "T_i": [10.0, true],
                "V_fi": [0.0, true],
                "stray": [50.0, false],
                "amplitude": [1.0, false],
                "offset": [0.0, false],
                "shift": [0.0, true]
            }
        },
        "tables": {"directory": "zte"}
    });
    let path = root.join("analysis.json");
    fs::write(&path, config.to_string()).expect("config should be written");
    path
}

#[test]
fn edges_command_lists_boundaries() {
    let temp = TempDir::new().expect("tempdir should be created");
    let shot = temp.path().join("s0500_02.asc");
    write_frame(&shot, 30.0, 100.0);

    let output = run_cli(&[
        "edges",
        "--shot",
        path_arg(&shot),
        "--spacing",
        "10",
        "--offset",
        "0",
        "--profile",
    ]);
    assert!(
        output.status.success(),
        "edges should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Edges (5 fibres): 0, 10, 20, 30, 40, 50"), "{stdout}");
    assert!(stdout.contains("row\tintensity\tedge"));
}

#[test]
fn split_command_lists_paired_fibres() {
    let temp = TempDir::new().expect("tempdir should be created");
    let config = write_config(temp.path(), 12.0);

    let output = run_cli(&["split", "--config", path_arg(&config)]);
    assert!(
        output.status.success(),
        "split should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("3A\t90.000\t801"), "{stdout}");
    assert!(stdout.contains("2B\t150.000\t801"), "{stdout}");
}

#[test]
fn fit_command_writes_exports_and_report() {
    let temp = TempDir::new().expect("tempdir should be created");
    let config = write_config(temp.path(), 12.0);
    let output_dir = temp.path().join("results");

    let output = run_cli(&[
        "fit",
        "--config",
        path_arg(&config),
        "--output",
        path_arg(&output_dir),
        "--execution",
        "parallel",
    ]);
    assert!(
        output.status.success(),
        "fit should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let export = output_dir
        .join("s0500_02 fit dat files")
        .join("s0500_02_3A_data_and_fit.dat");
    let content = fs::read_to_string(&export).expect("export should exist");
    let mut lines = content.lines();
    assert_eq!(lines.next(), Some("Wavelength shift,Background,Response,Shot,Fit"));
    assert_eq!(lines.next(), Some("Angstroms,a.u.,a.u.,a.u.,a.u."));

    let report: Value = serde_json::from_str(
        &fs::read_to_string(output_dir.join("report.json")).expect("report should exist"),
    )
    .expect("report should be JSON");
    assert_eq!(report["shot_name"], "s0500_02");
    assert_eq!(report["fibres"][2]["stage"], "derived");
    assert_eq!(report["fibres"][0]["stage"], "raw");
}

#[test]
fn unsupported_mass_number_fails_the_fibre() {
    let temp = TempDir::new().expect("tempdir should be created");
    let config = write_config(temp.path(), 40.0);

    let output = run_cli(&["fit", "--config", path_arg(&config)]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR: [CONFIG.ZTE_TABLE] fibre 3A"), "{stderr}");
    assert!(stderr.contains("no data available for A"), "{stderr}");
}

#[test]
fn ionization_command_prints_estimate() {
    let temp = TempDir::new().expect("tempdir should be created");
    fs::write(temp.path().join("zb_W.dat"), "1 1.0\n10 8.0\n100 20.0\n")
        .expect("table should be written");

    let output = run_cli(&[
        "ionization",
        "--tables",
        path_arg(temp.path()),
        "--element",
        "W",
        "--n-e",
        "1e24",
        "--te",
        "5",
    ]);
    assert!(
        output.status.success(),
        "ionization should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let estimate: Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(estimate["z"], 8.0);
    assert_eq!(estimate["bracket"], 0);
}

#[test]
fn errors_map_to_category_exit_codes() {
    let temp = TempDir::new().expect("tempdir should be created");

    let usage = run_cli(&["fit"]);
    assert_eq!(usage.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&usage.stderr).contains("ERROR: [CONFIG.CLI_USAGE]"));

    let missing = temp.path().join("absent.json");
    let io = run_cli(&["fit", "--config", path_arg(&missing)]);
    assert_eq!(io.status.code(), Some(6));
    assert!(String::from_utf8_lossy(&io.stderr).contains("ERROR: [IO.CONFIG_READ]"));
}
