//! Runs the readdb binary: import, load and query against an in-process server.

use readdb::locks::LockConfig;
use readdb::server::{Server, ServerConfig};
use readdb::store::CacheConfig;
use std::fs;
use std::io::Write;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use tempfile::TempDir;

fn readdb_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_readdb"))
}

fn run_readdb(work_dir: &Path, args: &[&str], stdin: &str) -> std::io::Result<Output> {
    let mut child = Command::new(readdb_binary())
        .current_dir(work_dir)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut input) = child.stdin.take() {
        input.write_all(stdin.as_bytes())?;
    }
    child.wait_with_output()
}

fn start_server(data_dir: &Path) -> u16 {
    let server = Server::bind(ServerConfig {
        bind: "127.0.0.1".to_string(),
        port: 0,
        data_dir: data_dir.to_path_buf(),
        users_file: None,
        lock: LockConfig::default(),
        cache: CacheConfig::default(),
        max_connections: 8,
    })
    .unwrap();
    let port = server.local_addr().port();
    // lives until the test process exits
    thread::spawn(move || server.serve());
    port
}

const SAM: &str = "@HD\tVN:1.6\tSO:unsorted\n\
@SQ\tSN:chr1\tLN:100000\n\
r1\t0\tchr1\t150\t60\t36M\t*\t0\t0\t*\t*\tNH:i:1\n\
r2\t0\tchr1\t150\t60\t36M\t*\t0\t0\t*\t*\tNH:i:1\n\
r3\t0\tchr1\t150\t60\t36M\t*\t0\t0\t*\t*\tNH:i:1\n\
r4\t16\tchr1\t1000\t60\t36M\t*\t0\t0\t*\t*\tNH:i:4\n\
r5\t4\t*\t0\t0\t*\t*\t0\t0\t*\t*\n";

#[test]
fn test_import_sam() -> std::io::Result<()> {
    let temp_dir = TempDir::new()?;
    let work_dir = temp_dir.path();
    fs::write(work_dir.join("reads.sam"), SAM)?;

    let output = run_readdb(
        work_dir,
        &[
            "import", "-i", "reads.sam", "-f", "sam", "-o", "hits.txt", "--chroms-out", "chroms.txt",
        ],
        "",
    )?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let hits = fs::read_to_string(work_dir.join("hits.txt"))?;
    let lines: Vec<&str> = hits.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "chr1\t150\t+\t36\t1");
    assert_eq!(lines[3], "chr1\t1035\t-\t36\t0.25");

    let chroms = fs::read_to_string(work_dir.join("chroms.txt"))?;
    assert_eq!(chroms.trim(), "chr1\t1");

    // the unmapped record is reported without raising verbosity
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("skipped 1 unmapped"), "{}", stderr);
    Ok(())
}

#[test]
fn test_load_and_query() -> std::io::Result<()> {
    let temp_dir = TempDir::new()?;
    let work_dir = temp_dir.path();
    let port = start_server(&work_dir.join("store")).to_string();
    fs::write(work_dir.join("reads.sam"), SAM)?;

    let output = run_readdb(work_dir, &["import", "-i", "reads.sam", "-f", "sam", "-o", "hits.txt"], "")?;
    assert!(output.status.success());

    let output = run_readdb(
        work_dir,
        &["load", "-p", &port, "-a", "chip", "-i", "hits.txt"],
        "",
    )?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    // the malformed and unknown-chromosome lines must not stop the batch
    let regions = "chr1:100-200\nnot a region\nchrUn:1-10\nchr1:900-1100:-\n";
    let output = run_readdb(
        work_dir,
        &["query", "-p", &port, "-a", "chip", "--dedup", "2"],
        regions,
    )?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "chr1:100-200",
            "1\t150\t+\t36\t1",
            "1\t150\t+\t36\t1",
            "not a region",
            "chrUn:1-10",
            "chr1:900-1100:-",
            "1\t1035\t-\t36\t0.25",
        ]
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not a region"));
    assert!(stderr.contains("chrUn"));

    let output = run_readdb(
        work_dir,
        &[
            "query", "-p", &port, "-a", "chip", "--histogram", "-b", "100", "--no-header",
        ],
        "chr1:101-1100\n",
    )?;
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "101\t3\n1001\t1\n");

    let output = run_readdb(
        work_dir,
        &["query", "-p", &port, "-a", "chip", "--format", "bed", "--no-header"],
        "chr1:1000-1100\n",
    )?;
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "1\t999\t1035\t.\t0.25\t-\n"
    );
    Ok(())
}

#[test]
fn test_load_reports_unknown_chromosomes() -> std::io::Result<()> {
    let temp_dir = TempDir::new()?;
    let work_dir = temp_dir.path();
    let port = start_server(&work_dir.join("store")).to_string();
    fs::write(
        work_dir.join("hits.txt"),
        "chr1\t100\t+\t36\t1\nchrX\t200\t+\t36\t1\nchrX\t300\t-\t36\t1\n",
    )?;

    let output = run_readdb(work_dir, &["load", "-p", &port, "-a", "chip", "-i", "hits.txt"], "")?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("rejected 2 lines"), "{}", stderr);
    assert!(stderr.contains("2 lines on unknown chromosome 'chrX'"), "{}", stderr);

    // the resolvable lines were still loaded
    let output = run_readdb(
        work_dir,
        &["query", "-p", &port, "-a", "chip", "--count", "--no-header"],
        "chr1:1-1000\n",
    )?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "1\n");
    Ok(())
}

#[test]
fn test_query_without_server_fails() -> std::io::Result<()> {
    let temp_dir = TempDir::new()?;
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port().to_string()
    };
    let output = run_readdb(
        temp_dir.path(),
        &["query", "-p", &port, "-a", "chip"],
        "chr1:1-100\n",
    )?;
    assert!(!output.status.success());
    Ok(())
}

#[test]
fn test_regions_from_hit_file() -> std::io::Result<()> {
    let temp_dir = TempDir::new()?;
    let work_dir = temp_dir.path();
    fs::write(
        work_dir.join("hits.txt"),
        "chr1\t100\t+\t36\t1\nchr1\t110\t+\t36\t1\nchr1\t500\t+\t36\t1\n",
    )?;
    let output = run_readdb(
        work_dir,
        &["regions", "--hits", "hits.txt", "--threshold", "2"],
        "chr1:1-1000\n",
    )?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "1\t109\t135\n");
    Ok(())
}
