mod channel_tls;
mod decay_rules;
mod dedup;
mod scoring;
mod shutdown;
