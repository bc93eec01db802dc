mod cell;
pub mod collector;
mod domain;
mod error;
mod gate;
mod ids;
mod program;
mod registry;
pub mod scan;
mod settings;
mod store;
mod tagged;
pub mod threads;
mod visitor;

pub use cell::{HeapValue, Payload, StoreId, ValueKind};
pub use collector::{CollectionStats, RootProvider};
pub use domain::*;
pub use error::*;
pub use gate::RunGate;
pub use ids::{DomainId, IdAllocator};
pub use program::*;
pub use registry::DomainRegistry;
pub use settings::*;
pub use store::*;
pub use tagged::*;
pub use threads::{ThreadContext, current_thread_token};
pub use visitor::{Visitable, Visitor};
