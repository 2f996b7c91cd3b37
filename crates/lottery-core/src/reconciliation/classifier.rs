//! Classification of raw contract events.
//!
//! Lottery contracts come from several templates that do not agree on event
//! names or argument layout, so classification is pluggable. The default
//! classifier goes by name patterns; the schema classifier only accepts the
//! event names configured per contract template.

use alloy_primitives::Address;
use lottery_config::{ClassifierKind, EventSchemaConfig, ListenerConfig};
use lottery_types::{ContractEvent, EventArg};
use std::collections::{HashMap, HashSet};

use crate::error::ReconciliationAmbiguity;

/// A confirmed purchase as reported by the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseConfirmation {
	pub buyer: Address,
	/// Ticket id the contract reported; informational only, numbers are
	/// assigned from the canonical ledger.
	pub ticket_id: u64,
	pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedEvent {
	Purchase(PurchaseConfirmation),
	/// Winning ticket numbers in rank order.
	DrawCompleted { winning_numbers: Vec<u64> },
}

pub trait EventClassifier: Send + Sync {
	fn classify(&self, event: &ContractEvent) -> Result<ClassifiedEvent, ReconciliationAmbiguity>;
}

/// Builds the classifier selected in the listener configuration.
pub fn classifier_from_config(config: &ListenerConfig) -> Box<dyn EventClassifier> {
	match config.classifier {
		ClassifierKind::NamePattern => Box::new(NamePatternClassifier),
		ClassifierKind::Schema => Box::new(SchemaClassifier::new(&config.schemas)),
	}
}

/// Classifies by event name:
/// - contains `Ticket` and `Purchase`: purchase;
/// - contains `Draw` and either `Complete` or `Finish`: draw completion.
#[derive(Debug, Default, Clone, Copy)]
pub struct NamePatternClassifier;

impl NamePatternClassifier {
	fn is_purchase(name: &str) -> bool {
		name.contains("Ticket") && name.contains("Purchase")
	}

	fn is_draw_completion(name: &str) -> bool {
		name.contains("Draw") && (name.contains("Complete") || name.contains("Finish"))
	}
}

impl EventClassifier for NamePatternClassifier {
	fn classify(&self, event: &ContractEvent) -> Result<ClassifiedEvent, ReconciliationAmbiguity> {
		if Self::is_purchase(&event.name) {
			parse_purchase(event).map(ClassifiedEvent::Purchase)
		} else if Self::is_draw_completion(&event.name) {
			parse_draw_completion(event)
		} else {
			Err(ReconciliationAmbiguity::new(event, "event name matches no pattern"))
		}
	}
}

/// Accepts only event names listed for some contract template.
#[derive(Debug, Clone, Default)]
pub struct SchemaClassifier {
	purchase_events: HashSet<String>,
	draw_events: HashSet<String>,
}

impl SchemaClassifier {
	pub fn new(schemas: &HashMap<String, EventSchemaConfig>) -> Self {
		let mut classifier = Self::default();
		for schema in schemas.values() {
			classifier
				.purchase_events
				.extend(schema.purchase_events.iter().cloned());
			classifier
				.draw_events
				.extend(schema.draw_events.iter().cloned());
		}
		classifier
	}
}

impl EventClassifier for SchemaClassifier {
	fn classify(&self, event: &ContractEvent) -> Result<ClassifiedEvent, ReconciliationAmbiguity> {
		if self.purchase_events.contains(&event.name) {
			parse_purchase(event).map(ClassifiedEvent::Purchase)
		} else if self.draw_events.contains(&event.name) {
			parse_draw_completion(event)
		} else {
			Err(ReconciliationAmbiguity::new(
				event,
				"event name is not part of any configured schema",
			))
		}
	}
}

/// Buyer is the first address-shaped argument; ticket id and quantity follow
/// it and default to 0 and 1.
fn parse_purchase(event: &ContractEvent) -> Result<PurchaseConfirmation, ReconciliationAmbiguity> {
	let (position, buyer) = event
		.args
		.iter()
		.enumerate()
		.find_map(|(i, arg)| arg.as_address().map(|address| (i, address)))
		.ok_or_else(|| ReconciliationAmbiguity::new(event, "no buyer address argument"))?;

	let ticket_id = numeric_arg(event, position + 1, 0, "ticket id")?;
	let quantity = numeric_arg(event, position + 2, 1, "quantity")?;
	if quantity == 0 {
		return Err(ReconciliationAmbiguity::new(event, "quantity is zero"));
	}
	Ok(PurchaseConfirmation {
		buyer,
		ticket_id,
		quantity,
	})
}

fn numeric_arg(
	event: &ContractEvent,
	index: usize,
	default: u64,
	what: &str,
) -> Result<u64, ReconciliationAmbiguity> {
	match event.args.get(index) {
		None => Ok(default),
		Some(arg) => arg.as_u64().ok_or_else(|| {
			ReconciliationAmbiguity::new(event, format!("{} '{}' is not a number", what, arg))
		}),
	}
}

/// Winning numbers are the first array argument.
fn parse_draw_completion(event: &ContractEvent) -> Result<ClassifiedEvent, ReconciliationAmbiguity> {
	let numbers = event
		.args
		.iter()
		.find_map(EventArg::as_array)
		.ok_or_else(|| ReconciliationAmbiguity::new(event, "no winning numbers argument"))?;
	let winning_numbers = numbers
		.iter()
		.map(|n| {
			n.as_u64().ok_or_else(|| {
				ReconciliationAmbiguity::new(event, format!("winning number '{}' is invalid", n))
			})
		})
		.collect::<Result<Vec<_>, _>>()?;
	Ok(ClassifiedEvent::DrawCompleted { winning_numbers })
}
