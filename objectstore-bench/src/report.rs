//! Human-readable summaries and the machine-readable operation log.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use bytesize::ByteSize;
use sketches_ddsketch::DDSketch;
use yansi::Paint;

use crate::benchmark::CleanupSummary;
use crate::operation::{OpType, Operations};

/// Prints throughput and latency for every type of operation in the log.
pub fn print_summary(title: &str, ops: &Operations) {
    println!();
    println!("{} ({} ops)", format!("## {title}").bold(), ops.len().bold());

    if ops.is_empty() {
        println!("  no operations recorded");
        return;
    }

    for op_type in ops.op_types() {
        print_op_type(op_type, &ops.filter_type(op_type));
    }
}

/// Prints the outcome of the cleanup phase.
pub fn print_cleanup(summary: &CleanupSummary) {
    println!();
    print!(
        "{} ({} objects deleted",
        "## CLEANUP".bold(),
        summary.deleted.blue()
    );
    if summary.failed > 0 {
        print!(", {}", format!("{} FAILURES", summary.failed).bold().red());
    }
    if summary.skipped > 0 {
        print!(", {} skipped", summary.skipped.yellow());
    }
    println!(")");
}

fn print_op_type(op_type: OpType, ops: &Operations) {
    let failures = ops.errors().count();
    let window = measurement_window(ops);

    let mut timing = DDSketch::default();
    let mut sizes = DDSketch::default();
    for op in ops.iter().filter(|op| !op.is_err()) {
        timing.add(op.duration().as_secs_f64());
        if op.size > 0 {
            sizes.add(op.size as f64);
        }
    }

    print!(
        "{} ({} ops",
        format!("{op_type}:").bold().green(),
        ops.len().bold()
    );
    if failures > 0 {
        print!(", {}", format!("{failures} FAILURES").bold().red());
    }
    println!(")");

    if sizes.count() > 0 {
        let avg = ByteSize::b((sizes.sum().unwrap_or_default() / sizes.count() as f64) as u64);
        let p50 = ByteSize::b(quantile(&sizes, 0.5) as u64);
        let p90 = ByteSize::b(quantile(&sizes, 0.9) as u64);
        let p99 = ByteSize::b(quantile(&sizes, 0.99) as u64);
        println!(
            "  size avg: {}; p50: {p50:.2}; p90: {p90:.2}; p99: {p99:.2}",
            avg.bold()
        );
    }

    print_ops(timing.count(), window);
    match ops.total_bytes() {
        0 => println!(),
        bytes => print_throughput(bytes, window),
    }

    if timing.count() > 0 {
        print_percentiles(&timing, Duration::from_secs_f64);
    }
}

/// Returns the duration over which throughput is computed.
///
/// This is the window in which all workers were active, falling back to the full extent of the
/// log if the workers never overlapped.
fn measurement_window(ops: &Operations) -> Duration {
    let (start, end) = ops.active_time_range().unwrap_or_else(|| {
        let start = ops.iter().map(|op| op.start).min();
        let end = ops.iter().map(|op| op.end).max();
        (
            start.unwrap_or(SystemTime::UNIX_EPOCH),
            end.unwrap_or(SystemTime::UNIX_EPOCH),
        )
    });
    end.duration_since(start).unwrap_or_default()
}

fn quantile(sketch: &DDSketch, q: f64) -> f64 {
    sketch.quantile(q).ok().flatten().unwrap_or_default()
}

fn print_percentiles<T: fmt::Debug>(sketch: &DDSketch, map: impl Fn(f64) -> T) {
    let ops = sketch.count();
    let avg = map(sketch.sum().unwrap_or_default() / ops as f64);
    let p50 = map(quantile(sketch, 0.5));
    let p90 = map(quantile(sketch, 0.9));
    let p99 = map(quantile(sketch, 0.99));
    println!(
        "  avg: {:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}",
        avg.bold()
    );
}

fn print_ops(ops: usize, duration: Duration) {
    let ops_ps = per_second(ops as f64, duration);
    print!("  {:.2} operations/s", ops_ps.bold());
}

fn print_throughput(total: u64, duration: Duration) {
    let throughput = per_second(total as f64, duration) as u64;
    println!(", {:.2}/s", ByteSize::b(throughput).bold());
}

fn per_second(value: f64, duration: Duration) -> f64 {
    match duration.as_secs_f64() {
        secs if secs > 0.0 => value / secs,
        _ => 0.0,
    }
}

/// Writes all operations to `path`, one JSON object per line.
///
/// The file is compressed with zstd if its name ends in `.zst`.
pub fn write_oplog(path: &Path, ops: &Operations) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);

    if path.extension().is_some_and(|ext| ext == "zst") {
        let mut encoder = zstd::Encoder::new(file, 0)?;
        write_lines(&mut encoder, ops)?;
        encoder.finish()?.flush()
    } else {
        write_lines(&mut file, ops)?;
        file.flush()
    }
}

fn write_lines(writer: &mut impl Write, ops: &Operations) -> io::Result<()> {
    for op in ops {
        serde_json::to_writer(&mut *writer, op)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}
