//! Subscription book for the upstream feed
//!
//! Remembers the mode of every subscribed token so the feed can replay its
//! subscriptions after a reconnect. Also provides request batching.

use std::collections::{BTreeMap, HashMap};

use crate::hot_path::codec::{encode_mode, encode_subscribe, encode_unsubscribe, Mode};

/// Default tokens per subscription request
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Mode assigned to tokens subscribed without an explicit mode
pub const DEFAULT_MODE: Mode = Mode::Quote;

/// Token -> mode map
#[derive(Debug, Default, Clone)]
pub struct SubscriptionBook {
    modes: HashMap<u32, Mode>,
}

impl SubscriptionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Book tokens in the default mode (existing modes are kept).
    /// Returns the upstream control message.
    pub fn subscribe(&mut self, tokens: &[u32]) -> String {
        for &token in tokens {
            self.modes.entry(token).or_insert(DEFAULT_MODE);
        }
        encode_subscribe(tokens)
    }

    /// Drop tokens from the book
    pub fn unsubscribe(&mut self, tokens: &[u32]) -> String {
        for token in tokens {
            self.modes.remove(token);
        }
        encode_unsubscribe(tokens)
    }

    /// Set the mode of tokens, booking any that were not subscribed
    pub fn set_mode(&mut self, mode: Mode, tokens: &[u32]) -> String {
        for &token in tokens {
            self.modes.insert(token, mode);
        }
        encode_mode(mode, tokens)
    }

    #[inline]
    pub fn mode(&self, token: u32) -> Option<Mode> {
        self.modes.get(&token).copied()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Sorted booked tokens
    pub fn tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self.modes.keys().copied().collect();
        tokens.sort_unstable();
        tokens
    }

    /// Control messages that restore every booked subscription: one
    /// subscribe, then one mode message per mode, batched by `batch_size`.
    pub fn resubscribe_messages(&self, batch_size: usize) -> Vec<String> {
        let tokens = self.tokens();
        let mut by_mode: BTreeMap<&'static str, (Mode, Vec<u32>)> = BTreeMap::new();
        for &token in &tokens {
            if let Some(mode) = self.mode(token) {
                by_mode.entry(mode.as_str()).or_insert((mode, Vec::new())).1.push(token);
            }
        }

        let mut messages = Vec::new();
        for batch in batches(&tokens, batch_size) {
            messages.push(encode_subscribe(batch));
        }
        for (mode, group) in by_mode.values() {
            for batch in batches(group, batch_size) {
                messages.push(encode_mode(*mode, batch));
            }
        }
        messages
    }
}

/// Split tokens into request-sized batches. A zero size means one token per batch.
#[inline]
pub fn batches(tokens: &[u32], batch_size: usize) -> std::slice::Chunks<'_, u32> {
    tokens.chunks(batch_size.max(1))
}
