//! Macro for defining opaque integer ID types.

/// Defines a newtype wrapper around `i64` for a single store-issued entity kind.
///
/// Generates `new`/`value` accessors, `Display`/`FromStr` (decimal), and
/// `Serialize`/`Deserialize` as a JSON number.
///
/// # Example
///
/// ```ignore
/// define_id!(NodeId);
///
/// let id = NodeId::new(42);
/// let parsed: NodeId = "42".parse()?;
/// assert_eq!(id, parsed);
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident) => {
        /// An opaque integer ID issued by the store.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw store-issued integer.
            ///
            /// # Panics
            ///
            /// Panics if `id` is not positive; store-issued IDs are always `>= 1`.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                assert!(id > 0, "ID must be positive");
                Self(id)
            }

            /// Returns the underlying integer value.
            #[must_use]
            pub const fn value(&self) -> i64 {
                self.0
            }

            /// Parses an ID from its decimal string form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let value: i64 = s
                    .parse()
                    .map_err(|_| $crate::IdError::InvalidFormat(s.to_string()))?;
                if value <= 0 {
                    return Err($crate::IdError::NotPositive(value));
                }
                Ok(Self(value))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self::new(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_i64(self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let value = i64::deserialize(deserializer)?;
                if value <= 0 {
                    return Err(serde::de::Error::custom(format!(
                        "invalid ID value: {value} (must be a positive integer)"
                    )));
                }
                Ok(Self(value))
            }
        }
    };
}
