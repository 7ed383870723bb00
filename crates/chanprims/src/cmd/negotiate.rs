use chanprims_alloc::ChannelMax;
use chanprims_session::negotiate_channel_max;
use serde::Serialize;

use crate::cmd::NegotiateArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{new_table, print_json, OutputFormat};

#[derive(Debug, Serialize)]
struct NegotiateOutput {
    client: u16,
    server: u16,
    channel_max: u16,
    /// Value sent back on the wire (0 when neither side set a limit).
    wire_value: u16,
    unlimited: bool,
}

pub fn run(args: NegotiateArgs, format: OutputFormat) -> CliResult<i32> {
    let negotiated = negotiate_channel_max(args.client, args.server);
    let out = NegotiateOutput {
        client: args.client,
        server: args.server,
        channel_max: negotiated.get(),
        wire_value: negotiated.to_negotiated(),
        unlimited: negotiated == ChannelMax::UNLIMITED,
    };

    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut table = new_table(&["CLIENT", "SERVER", "CHANNEL_MAX", "UNLIMITED"]);
            table.add_row(vec![
                out.client.to_string(),
                out.server.to_string(),
                out.channel_max.to_string(),
                out.unlimited.to_string(),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "client={} server={} channel_max={}{}",
                out.client,
                out.server,
                out.channel_max,
                if out.unlimited { " (unlimited)" } else { "" }
            );
        }
        OutputFormat::Raw => println!("{}", out.channel_max),
    }

    Ok(SUCCESS)
}
