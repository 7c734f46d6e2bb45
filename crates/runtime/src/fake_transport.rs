//! Fake host transport for exercising the state machine without a host.
//!
//! # Example
//!
//! ```ignore
//! let (transport, controller) = FakeTransportBuilder::new().build();
//! controller.fail_event(EventName::Reset);
//! // hand `transport` to the quiescer, then inspect:
//! let sent = controller.take_sent();
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use vmbackup_protocol::{EventName, HostEvent};

use crate::transport::{ChannelError, HostTransport};

#[derive(Debug, Default)]
struct FakeState {
	sent: Vec<HostEvent>,
	attempts: Vec<HostEvent>,
	fail_next: usize,
	fail_events: HashSet<EventName>,
	closed: bool,
}

/// Builder for creating fake transport instances.
#[derive(Debug, Default)]
pub struct FakeTransportBuilder {
	fail_events: HashSet<EventName>,
}

impl FakeTransportBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Makes every send of `event` fail from the start.
	pub fn failing(mut self, event: EventName) -> Self {
		self.fail_events.insert(event);
		self
	}

	/// Returns the transport and a controller sharing its state.
	pub fn build(self) -> (FakeTransport, FakeTransportController) {
		let state = Arc::new(Mutex::new(FakeState {
			fail_events: self.fail_events,
			..FakeState::default()
		}));
		(
			FakeTransport {
				state: Arc::clone(&state),
			},
			FakeTransportController { state },
		)
	}
}

/// Transport half handed to the code under test.
#[derive(Debug)]
pub struct FakeTransport {
	state: Arc<Mutex<FakeState>>,
}

impl HostTransport for FakeTransport {
	fn send(&mut self, event: &HostEvent) -> Result<(), ChannelError> {
		let mut state = self.state.lock();
		state.attempts.push(event.clone());
		if state.closed {
			return Err(ChannelError::Closed);
		}
		if state.fail_next > 0 {
			state.fail_next -= 1;
			return Err(ChannelError::Rejected(format!("injected failure for {}", event.event)));
		}
		if state.fail_events.contains(&event.event) {
			return Err(ChannelError::Rejected(format!("{} is configured to fail", event.event)));
		}
		state.sent.push(event.clone());
		Ok(())
	}
}

/// Controller for injecting failures and inspecting delivered events.
#[derive(Debug, Clone)]
pub struct FakeTransportController {
	state: Arc<Mutex<FakeState>>,
}

impl FakeTransportController {
	/// Fails the next `count` sends, whatever the event.
	pub fn fail_next(&self, count: usize) {
		self.state.lock().fail_next = count;
	}

	pub fn fail_event(&self, event: EventName) {
		self.state.lock().fail_events.insert(event);
	}

	pub fn heal_event(&self, event: EventName) {
		self.state.lock().fail_events.remove(&event);
	}

	/// Fails every subsequent send.
	pub fn close(&self) {
		self.state.lock().closed = true;
	}

	/// Events delivered successfully, in order.
	pub fn sent(&self) -> Vec<HostEvent> {
		self.state.lock().sent.clone()
	}

	pub fn sent_names(&self) -> Vec<EventName> {
		self.state.lock().sent.iter().map(|event| event.event).collect()
	}

	/// Every send attempt, including failed ones.
	pub fn attempts(&self) -> Vec<HostEvent> {
		self.state.lock().attempts.clone()
	}

	/// Takes delivered events, clearing the buffer.
	pub fn take_sent(&self) -> Vec<HostEvent> {
		std::mem::take(&mut self.state.lock().sent)
	}
}
