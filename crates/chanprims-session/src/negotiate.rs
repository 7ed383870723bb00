use chanprims_alloc::ChannelMax;

/// Agree on a channel limit from both sides' proposals.
///
/// 0 means "no limit". If one side proposes 0 the other side's value wins;
/// if both do, the result is [`ChannelMax::UNLIMITED`]. Otherwise the lower
/// proposal wins.
pub fn negotiate_channel_max(client: u16, server: u16) -> ChannelMax {
    let negotiated = match (client, server) {
        (0, other) | (other, 0) => other,
        (client, server) => client.min(server),
    };
    ChannelMax::from_negotiated(negotiated)
}
