use arena_core::broadcast::lobby_state_envelope;

use super::{authenticated_user, deliver_room_state, reply};
use crate::dispatcher::{EventContext, HandlerFuture};

pub(super) fn handle_ping(ctx: EventContext<'_>) -> HandlerFuture<'_> {
    Box::pin(async move {
        match authenticated_user(&ctx).await? {
            Some(user_id) => deliver_room_state(ctx.state, ctx.connection, &user_id).await?,
            None => reply(ctx.connection, lobby_state_envelope()).await?,
        }
        Ok(true)
    })
}
