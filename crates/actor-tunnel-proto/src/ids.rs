//! Request and message identifiers

use std::fmt;
use uuid::Uuid;

/// Length of every identifier on the wire
pub const ID_LEN: usize = 16;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// Generate a fresh random id
            pub fn new() -> Self {
                Self(*Uuid::new_v4().as_bytes())
            }

            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<[u8; ID_LEN]> for $name {
            fn from(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Uuid::from_bytes(self.0).fmt(f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// Identifies a logical HTTP exchange or tunneled WebSocket session for
    /// its whole lifetime. A tunneled WebSocket is keyed by the request id
    /// of the open that created it.
    RequestId
);

define_id!(
    /// Unique per physical frame. Only used to correlate acknowledgements.
    MessageId
);
