// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Pluggable authentication and authorization.

use codec::{QoS, TopicFilter};
use std::collections::HashMap;

/// Authentication and authorization hooks consulted by the broker.
///
/// The defaults allow everything, so a provider only overrides the decisions
/// it cares about. `authorize_subscribe` returns the maximum QoS it grants,
/// or `None` to refuse the subscription (0x80 in SUBACK).
pub trait AuthProvider: Send + Sync {
    fn authenticate(
        &mut self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> bool {
        true
    }

    fn authorize_publish(&mut self, _client_id: &str, _topic: &str) -> bool {
        true
    }

    fn authorize_subscribe(&mut self, _client_id: &str, _filter: &str) -> Option<QoS> {
        Some(QoS::ExactOnce)
    }

    /// Drop any per-client state. Called when the client disconnects.
    fn cleanup_client(&mut self, _client_id: &str) {}
}

/// Accepts everyone; the implicit provider when none is configured.
#[derive(Debug, Default)]
pub struct AllowAllAuth;

impl AuthProvider for AllowAllAuth {}

/// Username/password table lookup.
#[derive(Debug, Default)]
pub struct DictAuth {
    users: HashMap<String, String>,
}

impl DictAuth {
    #[must_use]
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn add_user(&mut self, username: &str, password: &str) -> &mut Self {
        self.users.insert(username.to_string(), password.to_string());
        self
    }
}

impl AuthProvider for DictAuth {
    fn authenticate(
        &mut self,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        let (Some(username), Some(password)) = (username, password) else {
            return false;
        };
        self.users
            .get(username)
            .map_or(false, |expected| expected.as_bytes() == password)
    }
}

#[derive(Debug)]
struct AclUser {
    password: String,
    role: String,
}

#[derive(Debug)]
struct AclRule {
    role: String,
    pattern: TopicFilter,
    publish: bool,
    subscribe: bool,
}

/// Role based access control with MQTT topic patterns.
///
/// Rules are evaluated in registration order; the first rule whose role and
/// pattern match decides. A client's role is fixed at authenticate time and
/// dropped again in `cleanup_client`.
#[derive(Debug, Default)]
pub struct AclAuth {
    users: HashMap<String, AclUser>,
    rules: Vec<AclRule>,
    client_roles: HashMap<String, String>,
}

/// Role assigned to clients whose username carries no role entry.
const DEFAULT_ROLE: &str = "default";

impl AclAuth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&mut self, username: &str, password: &str, role: &str) -> &mut Self {
        self.users.insert(
            username.to_string(),
            AclUser {
                password: password.to_string(),
                role: role.to_string(),
            },
        );
        self
    }

    /// Add an access rule for `role` over topics matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns error if `pattern` is not a valid topic filter.
    pub fn add_acl(
        &mut self,
        role: &str,
        pattern: &str,
        publish: bool,
        subscribe: bool,
    ) -> Result<&mut Self, codec::TopicError> {
        self.rules.push(AclRule {
            role: role.to_string(),
            pattern: TopicFilter::parse(pattern)?,
            publish,
            subscribe,
        });
        Ok(self)
    }

    fn role_of(&self, client_id: &str) -> &str {
        self.client_roles
            .get(client_id)
            .map_or(DEFAULT_ROLE, String::as_str)
    }
}

impl AuthProvider for AclAuth {
    fn authenticate(
        &mut self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        let Some(username) = username else {
            return false;
        };
        let Some(user) = self.users.get(username) else {
            return false;
        };
        if Some(user.password.as_bytes()) != password {
            return false;
        }
        self.client_roles
            .insert(client_id.to_string(), user.role.clone());
        true
    }

    fn authorize_publish(&mut self, client_id: &str, topic: &str) -> bool {
        let role = self.role_of(client_id);
        self.rules
            .iter()
            .any(|rule| rule.role == role && rule.publish && rule.pattern.is_match(topic))
    }

    fn authorize_subscribe(&mut self, client_id: &str, filter: &str) -> Option<QoS> {
        let role = self.role_of(client_id);
        if self
            .rules
            .iter()
            .any(|rule| rule.role == role && rule.subscribe && rule.pattern.is_match(filter))
        {
            Some(QoS::ExactOnce)
        } else {
            None
        }
    }

    fn cleanup_client(&mut self, client_id: &str) {
        self.client_roles.remove(client_id);
    }
}

type AuthenticateFn = dyn FnMut(&str, Option<&str>, Option<&[u8]>) -> bool + Send + Sync;
type AuthorizePublishFn = dyn FnMut(&str, &str) -> bool + Send + Sync;
type AuthorizeSubscribeFn = dyn FnMut(&str, &str) -> Option<QoS> + Send + Sync;

/// Delegates auth decisions to host-provided callbacks; unset callbacks
/// allow everything.
#[derive(Default)]
pub struct CallbackAuth {
    authenticate: Option<Box<AuthenticateFn>>,
    authorize_publish: Option<Box<AuthorizePublishFn>>,
    authorize_subscribe: Option<Box<AuthorizeSubscribeFn>>,
}

impl CallbackAuth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_authenticate<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&str, Option<&str>, Option<&[u8]>) -> bool + Send + Sync + 'static,
    {
        self.authenticate = Some(Box::new(callback));
        self
    }

    pub fn on_authorize_publish<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.authorize_publish = Some(Box::new(callback));
        self
    }

    pub fn on_authorize_subscribe<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&str, &str) -> Option<QoS> + Send + Sync + 'static,
    {
        self.authorize_subscribe = Some(Box::new(callback));
        self
    }
}

impl AuthProvider for CallbackAuth {
    fn authenticate(
        &mut self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        self.authenticate
            .as_mut()
            .map_or(true, |callback| callback(client_id, username, password))
    }

    fn authorize_publish(&mut self, client_id: &str, topic: &str) -> bool {
        self.authorize_publish
            .as_mut()
            .map_or(true, |callback| callback(client_id, topic))
    }

    fn authorize_subscribe(&mut self, client_id: &str, filter: &str) -> Option<QoS> {
        self.authorize_subscribe
            .as_mut()
            .map_or(Some(QoS::ExactOnce), |callback| {
                callback(client_id, filter)
            })
    }
}
