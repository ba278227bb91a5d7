// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Minimal broker on the default port.

use apiary::{Error, SimpleBroker};

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    SimpleBroker::new(1883)
        .on_connect(|client_id| println!("connected: {client_id}"))
        .on_message(|topic, payload, client_id| {
            println!("{client_id} -> {topic}: {} bytes", payload.len());
        })
        .run()
        .await
}
