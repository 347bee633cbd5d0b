use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::config::GeneratorConfig;
use crate::message::{ChatMessage, MessageType};

pub const MAX_USER_ID: u32 = 100_000;

const PHRASES: [&str; 50] = [
    "Hello everyone!",
    "How are you doing today?",
    "Great to be here!",
    "Anyone working on the assignment?",
    "This is an amazing chat system!",
    "Looking forward to connecting with everyone.",
    "What's the weather like today?",
    "Happy coding!",
    "Let's collaborate on this project.",
    "Does anyone have questions?",
    "I'm excited about this course!",
    "Good morning team!",
    "See you all later!",
    "Thanks for the help!",
    "This is really helpful.",
    "Can we schedule a meeting?",
    "I agree with that point.",
    "That's a great idea!",
    "Let me think about it.",
    "I'll get back to you soon.",
    "Perfect timing!",
    "Absolutely!",
    "Sounds good to me.",
    "I appreciate your input.",
    "Well done everyone!",
    "Keep up the good work!",
    "This is interesting.",
    "I'm learning a lot here.",
    "Thanks for sharing!",
    "Have a wonderful day!",
    "Let's stay connected.",
    "I'm here if you need help.",
    "Great question!",
    "That makes sense.",
    "I understand now.",
    "Could you clarify?",
    "I'm curious about that.",
    "Let's discuss this further.",
    "I'm on it!",
    "No problem at all.",
    "You're welcome!",
    "My pleasure!",
    "Glad I could help.",
    "Anytime!",
    "Feel free to ask.",
    "I'm available.",
    "Let me know if you need anything.",
    "Happy to assist!",
    "Cheers!",
    "Best regards!",
];

/// Produces a fixed number of synthetic messages: 90% TEXT, 5% JOIN, 5% LEAVE.
pub struct MessageGenerator {
    total: u64,
    progress_every: u64,
    rng: StdRng,
}

impl MessageGenerator {
    pub fn new(config: &GeneratorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            total: config.total_messages,
            progress_every: config.progress_every,
            rng,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn next_message(&mut self) -> ChatMessage {
        let user_id = self.rng.gen_range(1..=MAX_USER_ID);
        let username = format!("user{user_id}");

        let roll = self.rng.gen_range(0..100u32);
        let (message_type, body) = if roll < 90 {
            let phrase = PHRASES[self.rng.gen_range(0..PHRASES.len())];
            (MessageType::Text, phrase.to_string())
        } else if roll < 95 {
            (MessageType::Join, format!("{username} joined the chat"))
        } else {
            (MessageType::Leave, format!("{username} left the chat"))
        };

        ChatMessage::new(user_id, body, message_type)
    }

    /// Push exactly `total` messages, waiting whenever the channel is full.
    /// Returns how many were handed to the channel; less than `total` only if every
    /// receiver went away.
    pub async fn run(mut self, tx: async_channel::Sender<ChatMessage>) -> u64 {
        info!("Message generator started: {} messages", self.total);

        let mut generated = 0u64;
        while generated < self.total {
            let message = self.next_message();
            if tx.send(message).await.is_err() {
                warn!(
                    "Message channel closed after {} of {} messages",
                    generated, self.total
                );
                return generated;
            }
            generated += 1;

            if self.progress_every > 0 && generated % self.progress_every == 0 {
                info!("Generated {} messages", generated);
            }
        }

        info!("Message generation completed. Total: {} messages", generated);
        generated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn seeded(total: u64, seed: u64) -> MessageGenerator {
        MessageGenerator::new(&GeneratorConfig {
            total_messages: total,
            channel_capacity: 16,
            progress_every: 0,
            seed: Some(seed),
        })
    }

    #[test]
    fn test_type_mix_and_bodies() {
        let mut generator = seeded(0, 7);
        let mut counts: HashMap<MessageType, u64> = HashMap::new();

        for _ in 0..20_000 {
            let msg = generator.next_message();
            assert!((1..=MAX_USER_ID).contains(&msg.user_id));
            assert_eq!(msg.username, format!("user{}", msg.user_id));
            match msg.message_type {
                MessageType::Text => assert!(PHRASES.contains(&msg.message.as_str())),
                MessageType::Join => assert_eq!(msg.message, format!("{} joined the chat", msg.username)),
                MessageType::Leave => assert_eq!(msg.message, format!("{} left the chat", msg.username)),
            }
            *counts.entry(msg.message_type).or_default() += 1;
        }

        let text = counts[&MessageType::Text];
        let join = counts[&MessageType::Join];
        let leave = counts[&MessageType::Leave];
        assert!((17_600..=18_400).contains(&text), "text: {}", text);
        assert!((800..=1_200).contains(&join), "join: {}", join);
        assert!((800..=1_200).contains(&leave), "leave: {}", leave);
    }

    #[test]
    fn test_seed_is_reproducible() {
        let mut a = seeded(0, 99);
        let mut b = seeded(0, 99);
        for _ in 0..100 {
            let (x, y) = (a.next_message(), b.next_message());
            assert_eq!(x.user_id, y.user_id);
            assert_eq!(x.message, y.message);
            assert_eq!(x.message_type, y.message_type);
        }
    }

    #[tokio::test]
    async fn test_run_emits_exact_total_under_backpressure() {
        let (tx, rx) = async_channel::bounded(8);
        let handle = tokio::spawn(seeded(100, 1).run(tx));

        let mut received = 0u64;
        while received < 100 {
            assert!(rx.len() <= 8);
            rx.recv().await.unwrap();
            received += 1;
        }

        assert_eq!(handle.await.unwrap(), 100);
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_when_receivers_drop() {
        let (tx, rx) = async_channel::bounded(4);
        drop(rx);
        assert_eq!(seeded(10, 1).run(tx).await, 0);
    }
}
