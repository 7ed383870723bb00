use chanprims_alloc::AllocError;
use chanprims_session::{SessionError, SessionManager};
use serde::Serialize;

use crate::cmd::{Op, RunArgs};
use crate::exit::{session_error, session_error_code, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::{channel_name, new_table, print_json, OutputFormat};

#[derive(Debug, Serialize)]
struct StepOutput {
    #[serde(rename = "type")]
    kind: &'static str,
    step: usize,
    op: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    closed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<StepError>,
}

#[derive(Debug, Clone, Serialize)]
struct StepError {
    kind: &'static str,
    message: String,
    #[serde(skip)]
    code: i32,
}

#[derive(Debug, Default)]
struct Outcome {
    channel: Option<u16>,
    closed: Option<usize>,
}

#[derive(Debug, Serialize)]
struct SummaryOutput {
    #[serde(rename = "type")]
    kind: &'static str,
    channel_max: u16,
    allocated: Vec<u16>,
    sessions: usize,
    failed_steps: usize,
}

pub fn run(args: RunArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.connection.session_config()?;
    let _span = tracing::info_span!("connection", name = %config.name, cmd = "run").entered();
    let manager =
        SessionManager::new(config).map_err(|err| session_error("connection setup", err))?;

    let mut steps = Vec::with_capacity(args.ops.len());
    let mut exit_code = SUCCESS;

    for (idx, op) in args.ops.iter().copied().enumerate() {
        let step = match apply(&manager, op) {
            Ok(outcome) => StepOutput {
                kind: "step",
                step: idx + 1,
                op: op.to_string(),
                ok: true,
                channel: outcome.channel,
                closed: outcome.closed,
                error: None,
            },
            Err((channel, error)) => {
                exit_code = error.code;
                StepOutput {
                    kind: "step",
                    step: idx + 1,
                    op: op.to_string(),
                    ok: false,
                    channel,
                    closed: None,
                    error: Some(error),
                }
            }
        };

        let failed = !step.ok;
        if let OutputFormat::Json = format {
            print_json(&step);
        }
        steps.push(step);
        if failed && args.strict {
            break;
        }
    }

    let summary = SummaryOutput {
        kind: "summary",
        channel_max: manager.allocator().channel_max().get(),
        allocated: manager.allocator().allocated(),
        sessions: manager.len(),
        failed_steps: steps.iter().filter(|s| !s.ok).count(),
    };
    print_run(&steps, &summary, manager.reserved_channels(), format);

    Ok(exit_code)
}

type StepResult = std::result::Result<Outcome, (Option<u16>, StepError)>;

fn apply(manager: &SessionManager, op: Op) -> StepResult {
    match op {
        Op::Next => manager
            .open(None)
            .map(|channel| Outcome {
                channel: Some(channel),
                ..Outcome::default()
            })
            .map_err(|err| (None, step_error(err))),
        Op::Take(requested) => {
            let channel = to_channel(manager, requested)?;
            manager
                .open_on(channel, None)
                .map(|channel| Outcome {
                    channel: Some(channel),
                    ..Outcome::default()
                })
                .map_err(|err| (Some(channel), step_error(err)))
        }
        Op::Release(requested) => {
            // Release never fails: unknown or out-of-range channels are ignored.
            let Ok(channel) = u16::try_from(requested) else {
                return Ok(Outcome::default());
            };
            match manager.close(channel) {
                Ok(_) => Ok(Outcome {
                    channel: Some(channel),
                    ..Outcome::default()
                }),
                Err(SessionError::UnknownChannel(_)) => Ok(Outcome::default()),
                Err(err) => Err((Some(channel), step_error(err))),
            }
        }
        Op::Close(requested) => {
            let channel = u16::try_from(requested).map_err(|_| {
                (
                    None,
                    StepError {
                        kind: "unknown_channel",
                        message: format!("no session open on channel {requested}"),
                        code: FAILURE,
                    },
                )
            })?;
            manager
                .close(channel)
                .map(|info| Outcome {
                    channel: Some(info.channel),
                    ..Outcome::default()
                })
                .map_err(|err| (Some(channel), step_error(err)))
        }
        Op::CloseAll => Ok(Outcome {
            closed: Some(manager.close_all()),
            ..Outcome::default()
        }),
    }
}

/// Channel numbers outside the u16 range can never be valid.
fn to_channel(
    manager: &SessionManager,
    requested: i64,
) -> Result<u16, (Option<u16>, StepError)> {
    u16::try_from(requested).map_err(|_| {
        (
            None,
            StepError {
                kind: "invalid_channel_number",
                message: format!(
                    "invalid channel number {requested} (valid range 1..={})",
                    manager.allocator().channel_max()
                ),
                code: USAGE,
            },
        )
    })
}

fn step_error(err: SessionError) -> StepError {
    let kind = match &err {
        SessionError::Alloc(AllocError::ChannelsExhausted) => "channels_exhausted",
        SessionError::Alloc(AllocError::ChannelInUse(_)) => "channel_in_use",
        SessionError::Alloc(AllocError::InvalidChannelNumber { .. }) => "invalid_channel_number",
        SessionError::UnknownChannel(_) => "unknown_channel",
        SessionError::SessionExists(_) => "session_exists",
        SessionError::Config(_) | SessionError::Json(_) => "config",
    };
    StepError {
        kind,
        code: session_error_code(&err),
        message: err.to_string(),
    }
}

fn print_run(
    steps: &[StepOutput],
    summary: &SummaryOutput,
    reserved: &[u16],
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => print_json(summary),
        OutputFormat::Table => {
            let mut table = new_table(&["STEP", "OP", "RESULT", "CHANNEL", "DETAIL"]);
            for step in steps {
                table.add_row(vec![
                    step.step.to_string(),
                    step.op.clone(),
                    if step.ok { "ok" } else { "error" }.to_string(),
                    step.channel
                        .map(|c| format!("{c} ({})", channel_name(c, reserved)))
                        .unwrap_or_default(),
                    step_detail(step),
                ]);
            }
            println!("{table}");
            print_summary_line(summary);
        }
        OutputFormat::Pretty => {
            for step in steps {
                let channel = step
                    .channel
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "step={} op={} {} channel={} {}",
                    step.step,
                    step.op,
                    if step.ok { "ok" } else { "error" },
                    channel,
                    step_detail(step)
                );
            }
            print_summary_line(summary);
        }
        OutputFormat::Raw => {
            for step in steps {
                match (&step.error, step.channel) {
                    (Some(err), _) => println!("{}", err.kind),
                    (None, Some(channel)) => println!("{channel}"),
                    (None, None) => println!("-"),
                }
            }
        }
    }
}

fn step_detail(step: &StepOutput) -> String {
    match (&step.error, step.closed) {
        (Some(err), _) => err.message.clone(),
        (None, Some(closed)) => format!("closed {closed} sessions"),
        (None, None) => String::new(),
    }
}

fn print_summary_line(summary: &SummaryOutput) {
    println!(
        "channel_max={} sessions={} allocated={} failed_steps={}",
        summary.channel_max,
        summary.sessions,
        summary.allocated.len(),
        summary.failed_steps
    );
}
