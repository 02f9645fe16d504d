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

//! Registry of the language wrappers the core can spawn applications with

/// A language wrapper known to the core
#[derive(Debug, PartialEq, Eq)]
pub struct WrapperRegistryEntry {
    /// Language tag sent to the core as `!~PASSENGER_APP_TYPE`
    pub language: &'static str,
    /// Human-readable language name
    pub language_display_name: &'static str,
    /// Path of the loader script relative to the helper scripts directory
    pub path: &'static str,
    /// Process title of the spawned application processes
    pub process_title: &'static str,
    /// Interpreter used if none is configured
    pub default_interpreter: &'static str,
    /// Startup file used if none is configured
    pub default_startup_files: &'static [&'static str],
    /// Application type tags mapping to this entry besides the language tag
    pub aliases: &'static [&'static str],
    /// Whether the wrapper supports preloading the application and forking copies of it
    pub supports_smart_spawning: bool,
}

static ENTRIES: &[WrapperRegistryEntry] = &[
    WrapperRegistryEntry {
        language: "ruby",
        language_display_name: "Ruby",
        path: "rack-loader.rb",
        process_title: "Passenger RubyApp",
        default_interpreter: "ruby",
        default_startup_files: &["config.ru"],
        aliases: &["rack", "rails"],
        supports_smart_spawning: true,
    },
    WrapperRegistryEntry {
        language: "nodejs",
        language_display_name: "Node.js",
        path: "node-loader.js",
        process_title: "Passenger NodejsApp",
        default_interpreter: "node",
        default_startup_files: &["app.js"],
        aliases: &["node"],
        supports_smart_spawning: false,
    },
    WrapperRegistryEntry {
        language: "python",
        language_display_name: "Python",
        path: "wsgi-loader.py",
        process_title: "Passenger PythonApp",
        default_interpreter: "python",
        default_startup_files: &["passenger_wsgi.py"],
        aliases: &["wsgi"],
        supports_smart_spawning: false,
    },
    WrapperRegistryEntry {
        language: "meteor",
        language_display_name: "Meteor",
        path: "meteor-loader.rb",
        process_title: "Passenger MeteorApp",
        default_interpreter: "ruby",
        default_startup_files: &[".meteor"],
        aliases: &[],
        supports_smart_spawning: false,
    },
];

/// Looks up a wrapper by language tag or application type alias.
pub fn lookup(name: &str) -> Option<&'static WrapperRegistryEntry> {
    ENTRIES
        .iter()
        .find(|entry| entry.language == name || entry.aliases.contains(&name))
}

/// Iterates over all known wrappers.
pub fn entries() -> impl Iterator<Item = &'static WrapperRegistryEntry> {
    ENTRIES.iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups() {
        assert_eq!(lookup("rack").unwrap().language, "ruby");
        assert_eq!(lookup("rails").unwrap().language, "ruby");
        assert_eq!(lookup("ruby").unwrap().language, "ruby");
        assert_eq!(lookup("wsgi").unwrap().language, "python");
        assert_eq!(lookup("node").unwrap().language, "nodejs");
        assert_eq!(lookup("nodejs").unwrap().language, "nodejs");
        assert_eq!(lookup("meteor").unwrap().language, "meteor");
        assert!(lookup("cobol").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn unique_names() {
        let names: Vec<_> = entries()
            .flat_map(|entry| std::iter::once(&entry.language).chain(entry.aliases))
            .collect();
        for (i, name) in names.iter().enumerate() {
            assert!(!names[i + 1..].contains(name), "{name} is duplicated");
        }
    }
}
