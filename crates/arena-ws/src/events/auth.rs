use arena_core::registry::ConnectionRegistry;
use arena_models::connection::ConnectionState;
use arena_models::gateway::{EVENT_AUTH_ERROR, EVENT_AUTH_OK};
use serde_json::json;

use super::{deliver_room_state, error_envelope, reply};
use crate::dispatcher::{EventContext, HandlerFuture};

/// Verifies the token and binds its subject to the connection. A failed
/// handshake leaves the connection exactly as it was.
pub(super) fn handle_auth(ctx: EventContext<'_>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let identity = match ctx.state.verifier.verify_message(ctx.raw).await {
            Ok(identity) => identity,
            Err(error) => {
                tracing::warn!(connection_id = ctx.connection_id, %error, "auth rejected");
                reply(ctx.connection, error_envelope(EVENT_AUTH_ERROR, &error)).await?;
                return Ok(true);
            }
        };

        ctx.registry
            .set(ctx.connection_id, &identity.user_id, ConnectionState::Authed)
            .await?;
        ctx.state.profiles.remember(identity.profile());
        tracing::info!(
            connection_id = ctx.connection_id,
            user_id = %identity.user_id,
            "connection authenticated"
        );

        reply(
            ctx.connection,
            json!({
                "type": EVENT_AUTH_OK,
                "userId": identity.user_id,
                "username": identity.username,
                "imageUrl": identity.image_url,
                "issuer": identity.issuer,
                "exp": identity.expires_at,
            }),
        )
        .await?;
        deliver_room_state(ctx.state, ctx.connection, &identity.user_id).await?;
        Ok(true)
    })
}
