use std::io::Write;

use rstest::rstest;
use thermal_config::{TableRow, check_table_rows, load_sensor_table_csv};

fn write_csv(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("tempfile");
    f.write_all(contents.as_bytes()).expect("write");
    f
}

#[test]
fn loads_well_formed_table() {
    let f = write_csv("raw,celsius\n368,300\n1744,200\n16128,0\n");
    let rows = load_sensor_table_csv(f.path()).expect("load");
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[1],
        TableRow {
            raw: 1744,
            celsius: 200.0
        }
    );
}

#[rstest]
#[case("raw,grams\n1,2\n3,4\n", "headers 'raw,celsius'")]
#[case("raw,celsius\n10,100\n", "at least two rows")]
#[case("raw,celsius\n10,100\n10,90\n", "strictly increasing")]
#[case("raw,celsius\n20,100\n10,90\n", "strictly increasing")]
#[case("raw,celsius\n10,abc\n20,90\n", "invalid CSV row 2")]
fn rejects_malformed_tables(#[case] body: &str, #[case] expected: &str) {
    let f = write_csv(body);
    let err = load_sensor_table_csv(f.path()).expect_err("should fail");
    assert!(format!("{err}").contains(expected), "got: {err}");
}

#[test]
fn missing_file_names_the_path() {
    let err = load_sensor_table_csv(std::path::Path::new("/nonexistent/table.csv"))
        .expect_err("missing file");
    assert!(format!("{err}").contains("table.csv"));
}

#[test]
fn non_finite_temperatures_are_rejected() {
    let rows = [
        TableRow {
            raw: 1,
            celsius: 10.0,
        },
        TableRow {
            raw: 2,
            celsius: f32::NAN,
        },
    ];
    assert!(check_table_rows(&rows).is_err());
}
