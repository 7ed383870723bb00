use std::collections::HashSet;
use std::thread;
use std::time::Instant;

use chanprims_alloc::AllocError;
use chanprims_session::{SessionError, SessionManager};
use serde::Serialize;

use crate::cmd::StressArgs;
use crate::exit::{session_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{new_table, print_json, OutputFormat};

#[derive(Debug, Default, Serialize)]
struct PassStats {
    opened: usize,
    exhausted: usize,
    duplicates: usize,
}

#[derive(Debug, Serialize)]
struct StressOutput {
    channel_max: u16,
    threads: usize,
    per_thread: usize,
    passes: Vec<PassStats>,
    elapsed_ms: f64,
    ok: bool,
}

pub fn run(args: StressArgs, format: OutputFormat) -> CliResult<i32> {
    if args.threads == 0 || args.per_thread == 0 {
        return Err(CliError::new(
            USAGE,
            "--threads and --per-thread must be greater than zero",
        ));
    }

    let config = args.connection.session_config()?;
    let _span = tracing::info_span!("connection", name = %config.name, cmd = "stress").entered();
    let manager =
        SessionManager::new(config).map_err(|err| session_error("connection setup", err))?;

    let start = Instant::now();
    let mut passes = Vec::new();

    let (first, held) = open_pass(&manager, args.threads, args.per_thread)?;
    passes.push(first);

    if args.churn {
        for channel in held.iter().flatten() {
            manager
                .close(*channel)
                .map_err(|err| session_error("churn close", err))?;
        }
        let (second, _) = open_pass(&manager, args.threads, args.per_thread)?;
        passes.push(second);
    }

    manager.close_all();

    let ok = passes.iter().all(|p| p.duplicates == 0);
    let out = StressOutput {
        channel_max: manager.allocator().channel_max().get(),
        threads: args.threads,
        per_thread: args.per_thread,
        passes,
        elapsed_ms: (start.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
        ok,
    };
    print_stress(&out, format);

    if ok {
        Ok(SUCCESS)
    } else {
        Ok(DATA_INVALID)
    }
}

/// Open channels from `threads` threads at once. Returns stats and the
/// channels each thread ended up holding.
fn open_pass(
    manager: &SessionManager,
    threads: usize,
    per_thread: usize,
) -> CliResult<(PassStats, Vec<Vec<u16>>)> {
    let results: Vec<Result<(Vec<u16>, usize), SessionError>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(move || {
                    let mut opened = Vec::with_capacity(per_thread);
                    let mut exhausted = 0usize;
                    for _ in 0..per_thread {
                        match manager.open(None) {
                            Ok(channel) => opened.push(channel),
                            Err(SessionError::Alloc(AllocError::ChannelsExhausted)) => {
                                exhausted += 1
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    Ok((opened, exhausted))
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    });

    let mut stats = PassStats::default();
    let mut seen = HashSet::new();
    let mut held = Vec::with_capacity(threads);
    for result in results {
        let (opened, exhausted) = result.map_err(|err| session_error("open", err))?;
        stats.exhausted += exhausted;
        stats.opened += opened.len();
        stats.duplicates += opened.iter().filter(|c| !seen.insert(**c)).count();
        held.push(opened);
    }

    tracing::debug!(
        opened = stats.opened,
        exhausted = stats.exhausted,
        duplicates = stats.duplicates,
        "stress pass finished"
    );
    if stats.duplicates > 0 {
        tracing::warn!(duplicates = stats.duplicates, "duplicate channels observed");
    }

    Ok((stats, held))
}

fn print_stress(out: &StressOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = new_table(&["PASS", "OPENED", "EXHAUSTED", "DUPLICATES"]);
            for (idx, pass) in out.passes.iter().enumerate() {
                table.add_row(vec![
                    (idx + 1).to_string(),
                    pass.opened.to_string(),
                    pass.exhausted.to_string(),
                    pass.duplicates.to_string(),
                ]);
            }
            println!("{table}");
            println!(
                "channel_max={} threads={} per_thread={} elapsed={:.2}ms result={}",
                out.channel_max,
                out.threads,
                out.per_thread,
                out.elapsed_ms,
                if out.ok { "pass" } else { "fail" }
            );
        }
        OutputFormat::Pretty => {
            for (idx, pass) in out.passes.iter().enumerate() {
                println!(
                    "pass={} opened={} exhausted={} duplicates={}",
                    idx + 1,
                    pass.opened,
                    pass.exhausted,
                    pass.duplicates
                );
            }
            println!("result={}", if out.ok { "pass" } else { "fail" });
        }
        OutputFormat::Raw => {
            println!("{}", if out.ok { "pass" } else { "fail" });
        }
    }
}
