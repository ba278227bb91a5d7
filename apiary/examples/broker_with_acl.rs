// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Broker with role-based topic access and a publish rate limit.

use std::time::Duration;

use apiary::auth::AclAuth;
use apiary::ratelimit::RateLimiter;
use apiary::{Broker, Config, Error};

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let mut auth = AclAuth::new();
    auth.add_user("sensor-1", "secret", "sensor");
    auth.add_user("dashboard", "secret", "reader");
    auth.add_acl("sensor", "sensors/#", true, false)
        .expect("valid pattern");
    auth.add_acl("reader", "sensors/#", false, true)
        .expect("valid pattern");

    let mut config = Config::default();
    config.set_allow_anonymous(false);
    config.validate()?;

    let mut broker = Broker::bind(config).await?;
    broker.set_auth_provider(Box::new(auth));
    broker.add_interceptor(Box::new(RateLimiter::new(20, Duration::from_secs(1))));
    broker.run_loop().await;
    Ok(())
}
