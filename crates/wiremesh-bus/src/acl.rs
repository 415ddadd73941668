// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use serde::{Deserialize, Serialize};

use crate::pattern;

/// Subjects one identity may publish to and subscribe on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

impl Permissions {
    pub fn allow_all() -> Self {
        Self {
            publish: vec![">".into()],
            subscribe: vec![">".into()],
        }
    }

    pub fn publish_only(subjects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            publish: subjects.into_iter().map(Into::into).collect(),
            subscribe: Vec::new(),
        }
    }

    /// Unrestricted identities, such as the server's own connection.
    pub fn is_unrestricted(&self) -> bool {
        self.publish.iter().any(|p| p == ">")
    }

    pub fn can_publish(&self, subject: &str) -> bool {
        self.publish.iter().any(|p| pattern::matches(p, subject))
    }

    pub fn can_subscribe(&self, requested: &str) -> bool {
        self.subscribe.iter().any(|p| pattern::covers(p, requested))
    }

    pub fn with_subscribe(mut self, subject: impl Into<String>) -> Self {
        self.subscribe.push(subject.into());
        self
    }
}
