pub mod documents;
pub mod ledger;
pub mod settings;
