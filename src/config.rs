// Licensed under the MIT license.

//! Configuration knobs, defaults matching the device firmware's
//! `esp_config_default.h`.

use crate::error::{Error, Result};

/// Tunable knobs for an [`Engine`](crate::engine::Engine) instance.
#[derive(Clone, Debug)]
pub struct Config {
    pub max_conns: usize,
    pub max_send_retries: u8,
    pub ipd_max_buff_size: usize,
    pub conn_max_data_len: usize,
    pub at_port_baudrate: u32,
    pub input_use_process: bool,
    pub manual_tcp_receive: bool,
    pub at_echo: bool,
    /// Per-sub-command-step response timeout, and the default budget a
    /// blocking `submit` waits before giving up.
    pub cmd_timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_conns: 5,
            max_send_retries: 3,
            ipd_max_buff_size: 1460,
            conn_max_data_len: 2048,
            at_port_baudrate: 115_200,
            input_use_process: true,
            manual_tcp_receive: false,
            at_echo: false,
            cmd_timeout_ms: 5_000,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder(Config::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_conns == 0 || self.max_conns > 32 {
            return Err(Error::Config { details: "max_conns must be in 1..=32" });
        }
        if self.conn_max_data_len == 0 {
            return Err(Error::Config { details: "conn_max_data_len must be nonzero" });
        }
        if self.ipd_max_buff_size == 0 {
            return Err(Error::Config { details: "ipd_max_buff_size must be nonzero" });
        }
        Ok(())
    }
}

/// Builder for [`Config`]; every setter returns `Self` for chaining.
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn max_conns(mut self, v: usize) -> Self {
        self.0.max_conns = v;
        self
    }

    pub fn max_send_retries(mut self, v: u8) -> Self {
        self.0.max_send_retries = v;
        self
    }

    pub fn ipd_max_buff_size(mut self, v: usize) -> Self {
        self.0.ipd_max_buff_size = v;
        self
    }

    pub fn conn_max_data_len(mut self, v: usize) -> Self {
        self.0.conn_max_data_len = v;
        self
    }

    pub fn at_port_baudrate(mut self, v: u32) -> Self {
        self.0.at_port_baudrate = v;
        self
    }

    pub fn input_use_process(mut self, v: bool) -> Self {
        self.0.input_use_process = v;
        self
    }

    pub fn manual_tcp_receive(mut self, v: bool) -> Self {
        self.0.manual_tcp_receive = v;
        self
    }

    pub fn at_echo(mut self, v: bool) -> Self {
        self.0.at_echo = v;
        self
    }

    pub fn cmd_timeout_ms(mut self, v: u32) -> Self {
        self.0.cmd_timeout_ms = v;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.0.validate()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_oversized_conn_table() {
        let cfg = Config::builder().max_conns(64).build();
        assert!(cfg.is_err());
    }

    #[test]
    fn builder_chains() {
        let cfg = Config::builder()
            .max_conns(8)
            .manual_tcp_receive(true)
            .at_echo(true)
            .build()
            .unwrap();
        assert_eq!(cfg.max_conns, 8);
        assert!(cfg.manual_tcp_receive);
        assert!(cfg.at_echo);
    }
}
