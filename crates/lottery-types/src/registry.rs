//! Self-registration of pluggable implementations.

/// Implemented by each backend so the service can build a name → factory table.
pub trait ImplementationRegistry {
	/// Name used in the `implementations` tables of the config file.
	const NAME: &'static str;

	/// Factory function type for the implementation family.
	type Factory;

	fn factory() -> Self::Factory;
}
