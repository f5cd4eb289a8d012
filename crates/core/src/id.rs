// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Opaque string-backed identifiers.
//!
//! Session and instance ids cross the wire as plain strings but must never
//! be mixed up with each other (or with tool names, cwds, ...). `string_id!`
//! stamps out a newtype per id kind; the inner string stays private so the
//! only ways out are `as_str()`, `Display`, and serde.

/// How many leading characters [`ShortId`] shows.
const SHORT_ID_CHARS: usize = 8;

/// Display adapter that truncates an id for log fields.
///
/// Ids are UUIDs or editor-chosen strings; eight characters is enough to
/// tell sessions apart in a log tail without drowning it.
pub struct ShortId<'a>(&'a str);

impl std::fmt::Display for ShortId<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cut = self
            .0
            .char_indices()
            .nth(SHORT_ID_CHARS)
            .map(|(at, _)| at)
            .unwrap_or(self.0.len());
        f.write_str(&self.0[..cut])
    }
}

impl<'a> ShortId<'a> {
    /// Used by the macro below; not part of the public surface.
    #[doc(hidden)]
    pub fn wrap(raw: &'a str) -> Self {
        Self(raw)
    }
}

/// Declare a string-backed id newtype.
///
/// The generated type serializes as a bare string, compares against `&str`
/// in assertions, and offers `short()` for log lines:
///
/// ```ignore
/// string_id! {
///     /// What this id names.
///     pub struct WidgetId;
/// }
/// ```
#[macro_export]
macro_rules! string_id {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Truncated form for log fields.
            pub fn short(&self) -> $crate::id::ShortId<'_> {
                $crate::id::ShortId::wrap(&self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

/// Mint a fresh opaque id (UUID v4).
///
/// The broker issues these for sessions; editors pick their own instance
/// ids and the broker treats both as opaque.
pub fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
