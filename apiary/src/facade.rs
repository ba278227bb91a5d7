// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Start a broker in a few lines.

use async_trait::async_trait;
use codec::QoS;
use std::collections::HashMap;

use crate::auth::{AuthProvider, DictAuth};
use crate::broker::Broker;
use crate::config::Config;
use crate::error::Error;
use crate::hooks::Hooks;

type MessageCallback = dyn Fn(&str, &[u8], &str) + Send + Sync;
type ClientCallback = dyn Fn(&str) + Send + Sync;

#[derive(Default)]
struct CallbackHooks {
    on_message: Option<Box<MessageCallback>>,
    on_connect: Option<Box<ClientCallback>>,
    on_disconnect: Option<Box<ClientCallback>>,
}

#[async_trait]
impl Hooks for CallbackHooks {
    async fn on_connect(
        &self,
        client_id: &str,
        _username: Option<&str>,
        _will_topic: Option<&str>,
    ) -> bool {
        if let Some(callback) = &self.on_connect {
            callback(client_id);
        }
        true
    }

    async fn on_publish(
        &self,
        client_id: &str,
        topic: &str,
        payload: &[u8],
        _qos: QoS,
        _retain: bool,
    ) {
        if let Some(callback) = &self.on_message {
            callback(topic, payload, client_id);
        }
    }

    async fn on_disconnect(&self, client_id: &str, _graceful: bool) {
        if let Some(callback) = &self.on_disconnect {
            callback(client_id);
        }
    }
}

/// Simplified broker surface for hosts that only need a port, optional
/// credentials and a couple of callbacks.
///
/// ```no_run
/// use apiary::SimpleBroker;
///
/// # async fn run() -> Result<(), apiary::Error> {
/// SimpleBroker::new(1883)
///     .on_message(|topic, payload, client_id| {
///         println!("{client_id} published {topic}: {payload:?}");
///     })
///     .run()
///     .await
/// # }
/// ```
pub struct SimpleBroker {
    config: Config,
    auth: Option<Box<dyn AuthProvider>>,
    hooks: CallbackHooks,
}

impl SimpleBroker {
    #[must_use]
    pub fn new(port: u16) -> Self {
        let mut config = Config::default();
        config.set_port(port);
        Self {
            config,
            auth: None,
            hooks: CallbackHooks::default(),
        }
    }

    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            auth: None,
            hooks: CallbackHooks::default(),
        }
    }

    #[must_use]
    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.config.set_max_clients(max_clients);
        self
    }

    /// Require username/password authentication against `users`.
    #[must_use]
    pub fn users(mut self, users: HashMap<String, String>) -> Self {
        self.auth = Some(Box::new(DictAuth::new(users)));
        self
    }

    /// Install a custom auth provider; overrides `users`.
    #[must_use]
    pub fn auth(mut self, auth: Box<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Called for every accepted PUBLISH with (topic, payload, client id).
    #[must_use]
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &[u8], &str) + Send + Sync + 'static,
    {
        self.hooks.on_message = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.on_connect = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.on_disconnect = Some(Box::new(callback));
        self
    }

    /// Bind and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the listener cannot bind.
    pub async fn run(self) -> Result<(), Error> {
        self.config.validate()?;
        let mut broker = Broker::bind(self.config).await?;
        if let Some(auth) = self.auth {
            broker.set_auth_provider(auth);
        }
        broker.set_hooks(Box::new(self.hooks));
        broker.run_loop().await;
        Ok(())
    }
}
