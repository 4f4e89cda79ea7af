use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;

#[derive(Debug)]
struct Conversation {
    turns: VecDeque<String>,
    touched: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<String, Conversation>,
    clock: u64,
}

impl MemoryState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .conversations
            .iter()
            .min_by_key(|(_, conversation)| conversation.touched)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.conversations.remove(&id);
        }
    }
}

/// Recent turns per conversation, kept in process only.
///
/// Each conversation keeps at most `turns_per_conversation` turns and at most
/// `max_conversations` conversations are tracked; the least recently touched
/// one is dropped first. Contents are lost on restart.
#[derive(Debug)]
pub struct ConversationMemory {
    turns_per_conversation: usize,
    max_conversations: usize,
    state: Mutex<MemoryState>,
}

impl ConversationMemory {
    pub fn new(turns_per_conversation: usize, max_conversations: usize) -> Self {
        Self {
            turns_per_conversation,
            max_conversations: max_conversations.max(1),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub async fn record(&self, conversation_id: &str, turn: String) {
        if self.turns_per_conversation == 0 {
            return;
        }

        let mut guard = self.state.lock().await;
        let touched = guard.tick();

        if !guard.conversations.contains_key(conversation_id)
            && guard.conversations.len() >= self.max_conversations
        {
            guard.evict_least_recent();
        }

        let conversation = guard
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation {
                turns: VecDeque::new(),
                touched,
            });
        conversation.touched = touched;
        conversation.turns.push_back(turn);
        while conversation.turns.len() > self.turns_per_conversation {
            conversation.turns.pop_front();
        }
    }

    /// Turns of a conversation, oldest first.
    pub async fn recent(&self, conversation_id: &str) -> Vec<String> {
        let mut guard = self.state.lock().await;
        let touched = guard.tick();
        match guard.conversations.get_mut(conversation_id) {
            Some(conversation) => {
                conversation.touched = touched;
                conversation.turns.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub async fn forget(&self, conversation_id: &str) {
        self.state.lock().await.conversations.remove(conversation_id);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.state.lock().await.conversations.len()
    }
}
