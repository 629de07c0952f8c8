//! GPIO pin ownership for PSU switching and sensing.
//!
//! Pins are acquired from the configuration snapshot and released before
//! every reconfiguration. The controller never touches pin state outside
//! of this bank, and nothing here is global: dropping the bank returns
//! the lines to the system.

use anyhow::{Context, Result};
use rppal::gpio::Gpio;
use tracing::{debug, info};

use crate::config::{PsuConfig, SensePull, SensingMethod, SwitchingMethod};

/// Output line driving the PSU relay/latch.
pub trait SwitchPin: Send {
    fn write(&mut self, high: bool) -> Result<()>;
}

/// Input line reporting the actual PSU state.
pub trait SensePin: Send {
    fn read(&self) -> Result<bool>;
}

struct RpiSwitchPin {
    pin: rppal::gpio::OutputPin,
    bcm: u8,
}

impl SwitchPin for RpiSwitchPin {
    fn write(&mut self, high: bool) -> Result<()> {
        if high {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        debug!("GPIO pin {} set {}", self.bcm, if high { "high" } else { "low" });
        Ok(())
    }
}

struct RpiSensePin {
    pin: rppal::gpio::InputPin,
}

impl SensePin for RpiSensePin {
    fn read(&self) -> Result<bool> {
        Ok(self.pin.is_high())
    }
}

/// Owned switch/sense lines for the current configuration snapshot.
#[derive(Default)]
pub struct PinBank {
    pub(crate) switch: Option<Box<dyn SwitchPin>>,
    pub(crate) sense: Option<Box<dyn SensePin>>,
}

impl PinBank {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Acquire the pins required by the configuration snapshot.
    pub fn configure(cfg: &PsuConfig) -> Result<Self> {
        let mut bank = Self::empty();
        if cfg.switching_method != SwitchingMethod::Gpio
            && cfg.sensing_method != SensingMethod::Gpio
        {
            return Ok(bank);
        }

        let gpio = Gpio::new().context("opening GPIO controller")?;

        if cfg.switching_method == SwitchingMethod::Gpio {
            info!("Using GPIO for On/Off");
            info!("Configuring GPIO for pin {}", cfg.onoff_gpio_pin);
            let pin = gpio
                .get(cfg.onoff_gpio_pin)
                .with_context(|| format!("acquiring switch pin {}", cfg.onoff_gpio_pin))?;
            // initial level = PSU off
            let out = if cfg.invert_onoff_gpio_pin {
                pin.into_output_high()
            } else {
                pin.into_output_low()
            };
            bank.switch = Some(Box::new(RpiSwitchPin { pin: out, bcm: cfg.onoff_gpio_pin }));
        }

        if cfg.sensing_method == SensingMethod::Gpio {
            info!("Using GPIO sensing to determine PSU on/off state.");
            info!("Configuring GPIO for pin {}", cfg.sense_gpio_pin);
            let pin = gpio
                .get(cfg.sense_gpio_pin)
                .with_context(|| format!("acquiring sense pin {}", cfg.sense_gpio_pin))?;
            let inp = match cfg.sense_gpio_pull {
                SensePull::Disabled => pin.into_input(),
                SensePull::Up => pin.into_input_pullup(),
                SensePull::Down => pin.into_input_pulldown(),
            };
            bank.sense = Some(Box::new(RpiSensePin { pin: inp }));
        }

        Ok(bank)
    }

    /// Release every configured pin.
    pub fn release(&mut self) {
        if self.switch.take().is_some() {
            debug!("released switch pin");
        }
        if self.sense.take().is_some() {
            debug!("released sense pin");
        }
    }

    pub fn write_switch(&mut self, high: bool) -> Result<()> {
        match self.switch.as_mut() {
            Some(pin) => pin.write(high),
            None => anyhow::bail!("switch pin is not configured"),
        }
    }

    pub fn read_sense(&self) -> Result<bool> {
        match self.sense.as_ref() {
            Some(pin) => pin.read(),
            None => anyhow::bail!("sense pin is not configured"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticPin(bool);

    impl SensePin for StaticPin {
        fn read(&self) -> Result<bool> {
            Ok(self.0)
        }
    }

    #[test]
    fn unconfigured_bank_reports_errors() {
        let mut bank = PinBank::empty();
        assert!(bank.write_switch(true).is_err());
        assert!(bank.read_sense().is_err());
    }

    #[test]
    fn release_drops_configured_pins() {
        let mut bank = PinBank {
            switch: None,
            sense: Some(Box::new(StaticPin(true))),
        };
        assert!(bank.read_sense().unwrap());
        bank.release();
        assert!(bank.read_sense().is_err());
    }
}
