use arena_models::room::MemberProfile;
use futures_util::future::join_all;

use crate::store::{RoomStore, Store};

/// Usernames and avatars remembered from verified tokens. Every operation is
/// best-effort: failures are logged and callers get empty fields instead.
#[derive(Clone)]
pub struct ProfileCache {
    store: Store,
}

impl ProfileCache {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Fire-and-forget write; never delays the caller.
    pub fn remember(&self, profile: MemberProfile) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(error) = store.save_profile(&profile).await {
                tracing::warn!(user_id = %profile.user_id, %error, "failed to cache profile");
            }
        });
    }

    pub async fn lookup(&self, user_id: &str) -> MemberProfile {
        match self.store.load_profile(user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => MemberProfile {
                user_id: user_id.to_string(),
                ..Default::default()
            },
            Err(error) => {
                tracing::debug!(user_id, %error, "profile lookup failed");
                MemberProfile {
                    user_id: user_id.to_string(),
                    ..Default::default()
                }
            }
        }
    }

    /// Profiles for `users`, in the same order.
    pub async fn enrich(&self, users: &[String]) -> Vec<MemberProfile> {
        join_all(users.iter().map(|user_id| self.lookup(user_id))).await
    }
}
