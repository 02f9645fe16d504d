// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Helpers for deserializing configuration files

use serde::Deserialize;
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};

/// A wrapper around the `Vec` type allowing more comfortable deserialization.
///
/// If a list is encountered in the configuration file, it is deserialized into `Vec` directly.
/// A single value is deserialized as a `Vec` instance with one element instead.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(
    from = "OneOrManyRepr<T>",
    bound(deserialize = "T: Deserialize<'de>")
)]
pub struct OneOrMany<T> {
    inner: Vec<T>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrManyRepr<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> From<OneOrManyRepr<T>> for OneOrMany<T> {
    fn from(value: OneOrManyRepr<T>) -> Self {
        match value {
            OneOrManyRepr::Many(inner) => Self { inner },
            OneOrManyRepr::One(value) => Self { inner: vec![value] },
        }
    }
}

impl<T> OneOrMany<T> {
    /// Unwraps the inner `Vec` type
    pub fn into_inner(self) -> Vec<T> {
        self.inner
    }
}

impl<T> Debug for OneOrMany<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

// Deriving `Default` would unnecessarily require `T` to implement `Default`
impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self {
            inner: Default::default(),
        }
    }
}

impl<T> Deref for OneOrMany<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> DerefMut for OneOrMany<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(value: Vec<T>) -> Self {
        Self { inner: value }
    }
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        value.inner
    }
}

impl<'a, T> IntoIterator for &'a OneOrMany<T> {
    type Item = <&'a Vec<T> as IntoIterator>::Item;
    type IntoIter = <&'a Vec<T> as IntoIterator>::IntoIter;
    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl<T> IntoIterator for OneOrMany<T> {
    type Item = <Vec<T> as IntoIterator>::Item;
    type IntoIter = <Vec<T> as IntoIterator>::IntoIter;
    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    struct Conf {
        value: OneOrMany<String>,
    }

    #[test]
    fn one_or_many() {
        let conf: Conf = serde_yaml::from_str("value: single").unwrap();
        assert_eq!(conf.value.into_inner(), vec!["single".to_owned()]);

        let conf: Conf = serde_yaml::from_str("value: [first, second]").unwrap();
        assert_eq!(
            conf.value.into_inner(),
            vec!["first".to_owned(), "second".to_owned()]
        );

        let conf: Conf = serde_yaml::from_str("{}").unwrap();
        assert!(conf.value.is_empty());
    }
}
