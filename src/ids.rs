//! Newtype identifiers, kept distinct so a stray `AccountId` can never be
//! passed where a `PositionId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(AccountId);
id_type!(OwnerId);
id_type!(PositionId);
id_type!(OrderId);
id_type!(TradeId);
id_type!(ConnectionId);

/// Ticker symbol, e.g. `"BTC-USD"`. Cheap to clone and used as a map key
/// throughout the price/position/order layers.
pub type Symbol = String;
