// Output of one dispatch or one agent tick.
//
// A `ProcessingResult` is an immutable bag of outbound messages together with
// the earliest event time among them (`NEVER` when there is none). Results
// from several handlers or agents are merged by concatenation, preserving the
// order they were produced in.

use crate::message::Message;
use crate::types::{NEVER, SimTime};

#[derive(Clone, Debug)]
pub struct ProcessingResult {
    messages: Vec<Message>,
    next_event_time: SimTime,
}

impl Default for ProcessingResult {
    fn default() -> Self {
        Self::empty()
    }
}

impl ProcessingResult {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            next_event_time: NEVER,
        }
    }

    pub fn of(messages: Vec<Message>) -> Self {
        let next_event_time = messages
            .iter()
            .filter_map(Message::scheduled_time)
            .min()
            .unwrap_or(NEVER);
        Self {
            messages,
            next_event_time,
        }
    }

    pub fn single(message: Message) -> Self {
        Self::of(vec![message])
    }

    /// Concatenate results in iteration order.
    pub fn merge(results: impl IntoIterator<Item = ProcessingResult>) -> Self {
        let mut messages = Vec::new();
        let mut next_event_time = NEVER;
        for result in results {
            next_event_time = next_event_time.min(result.next_event_time);
            messages.extend(result.messages);
        }
        Self {
            messages,
            next_event_time,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn next_event_time(&self) -> SimTime {
        self.next_event_time
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

impl From<Message> for ProcessingResult {
    fn from(message: Message) -> Self {
        Self::single(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, EntityHandle};

    #[derive(Debug)]
    struct Note(&'static str);

    #[test]
    fn empty_result_never_wakes() {
        let result = ProcessingResult::empty();
        assert!(result.is_empty());
        assert_eq!(result.next_event_time(), NEVER);
    }

    #[test]
    fn next_event_time_is_the_minimum_event_time() {
        let h = EntityHandle::detached("p").unwrap();
        let result = ProcessingResult::of(vec![
            Message::event(&h, Note("late"), 50, Address::external(&h), Address::nowhere()),
            Message::action(&h, Note("now"), Address::external(&h), Address::nowhere()),
            Message::event(&h, Note("soon"), 20, Address::external(&h), Address::nowhere()),
        ]);
        assert_eq!(result.len(), 3);
        assert_eq!(result.next_event_time(), 20);
    }

    #[test]
    fn merge_concatenates_in_order() {
        let h = EntityHandle::detached("m").unwrap();
        let first = ProcessingResult::single(Message::event(
            &h,
            Note("a"),
            30,
            Address::external(&h),
            Address::nowhere(),
        ));
        let second = ProcessingResult::single(Message::action(
            &h,
            Note("b"),
            Address::external(&h),
            Address::nowhere(),
        ));
        let merged = ProcessingResult::merge([first, ProcessingResult::empty(), second]);
        let notes: Vec<&str> = merged
            .messages()
            .iter()
            .filter_map(|m| m.content().and_then(|c| c.downcast_ref::<Note>()))
            .map(|n| n.0)
            .collect();
        assert_eq!(notes, vec!["a", "b"]);
        assert_eq!(merged.next_event_time(), 30);
    }
}
