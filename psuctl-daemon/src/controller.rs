/**
 * PSU CONTROLLER - Machine à états du PSU et coordinateur d'arrêt idle
 *
 * RÔLE :
 * Ce module possède la croyance on/off du PSU, la réconcilie avec l'état
 * réel via la poll loop, déclenche l'auto-on depuis le flux G-code et
 * pilote la coupure automatique après refroidissement des heaters.
 *
 * FONCTIONNEMENT :
 * - La croyance n'est mutée QUE par la poll loop ; une commutation force
 *   un re-poll au lieu d'écrire la croyance directement
 * - Les commutations sont sérialisées entre elles et ne bloquent jamais
 *   le chemin des commandes G-code (hand-off vers une task)
 * - L'arrêt idle attend les heaters sous le seuil, indéfiniment, et
 *   s'interrompt à la moindre activité du flux de commandes
 */

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::backends::BackendRegistry;
use crate::config::{PsuConfig, SensingMethod, SwitchingMethod};
use crate::events::EventSink;
use crate::gpio::PinBank;
use crate::idle::{FireFn, IdleTimer};
use crate::printer::PrinterHost;
use crate::state::{PsuState, Shared};

/// Scripts hôte exécutés autour des commutations
pub const POST_ON_SCRIPT: &str = "psu_post_on";
pub const PRE_OFF_SCRIPT: &str = "psu_pre_off";

/// Intervalle de re-check des températures pendant l'attente heaters
const HEATER_POLL: Duration = Duration::from_secs(5);

/// Décision pour une commande G-code observée
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuingVerdict {
    /// La commande continue vers le firmware
    Pass,
    /// La commande est consommée localement (pseudo on/off)
    Drop,
}

pub struct PsuController {
    me: Weak<PsuController>,
    cfg: Shared<PsuConfig>,
    state: PsuState,
    pins: parking_lot::Mutex<PinBank>,
    registry: Arc<BackendRegistry>,
    printer: Arc<dyn PrinterHost>,
    events: Arc<dyn EventSink>,
    idle: IdleTimer,
    poll_wake: watch::Sender<()>,
    switch_gate: tokio::sync::Mutex<()>,
}

impl PsuController {
    pub fn new(
        cfg: Shared<PsuConfig>,
        registry: Arc<BackendRegistry>,
        printer: Arc<dyn PrinterHost>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cfg,
            state: PsuState::default(),
            pins: parking_lot::Mutex::new(PinBank::empty()),
            registry,
            printer,
            events,
            idle: IdleTimer::new(),
            poll_wake: watch::channel(()).0,
            switch_gate: tokio::sync::Mutex::new(()),
        })
    }

    fn handle(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    fn snapshot(&self) -> PsuConfig {
        self.cfg.lock().clone()
    }

    pub fn is_on(&self) -> bool {
        self.state.is_on()
    }

    /// Demande un re-poll immédiat ; les demandes rapprochées fusionnent.
    pub fn request_check(&self) {
        self.poll_wake.send_replace(());
    }

    // ---- commutation ----

    pub async fn turn_psu_on(&self) {
        let cfg = self.snapshot();
        if cfg.switching_method == SwitchingMethod::None {
            debug!("switching disabled, ignoring turn on");
            return;
        }

        let _gate = self.switch_gate.lock().await;
        info!("Switching PSU On");
        match cfg.switching_method {
            SwitchingMethod::Gcode => {
                debug!("Switching PSU On Using GCODE: {}", cfg.on_gcode_command);
                if let Err(e) = self.printer.send_gcode(&[cfg.on_gcode_command.clone()]).await {
                    error!("failed to send on G-code: {e:#}");
                }
            }
            SwitchingMethod::System => {
                debug!("Switching PSU On Using SYSTEM: {}", cfg.on_system_command);
                match run_system_command(&cfg.on_system_command).await {
                    Ok(code) => debug!("On system command returned: {}", code),
                    Err(e) => error!("On system command failed: {e:#}"),
                }
            }
            SwitchingMethod::Gpio => {
                debug!("Switching PSU On Using GPIO: {}", cfg.onoff_gpio_pin);
                let level = !cfg.invert_onoff_gpio_pin;
                let written = self.pins.lock().write_switch(level);
                if let Err(e) = written {
                    error!("Exception while writing GPIO line: {e:#}");
                    return;
                }
            }
            SwitchingMethod::Plugin => {
                debug!("Switching PSU On Using PLUGIN: {}", cfg.switching_backend);
                if let Err(e) = self.registry.switch(&cfg.switching_backend, true) {
                    error!("{e}");
                    return;
                }
            }
            SwitchingMethod::None => unreachable!(),
        }

        if !sensed_externally(cfg.sensing_method) {
            self.state.set_internal_tracked(true);
        }

        tokio::time::sleep(cfg.settle_after_on()).await;
        self.request_check();

        if let Some(me) = self.handle() {
            let delay = cfg.reconnect_delay();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                me.connect_printer().await;
            });
        }
    }

    async fn connect_printer(&self) {
        let cfg = self.snapshot();
        if cfg.connect_on_power_on {
            match self.printer.is_closed_or_error().await {
                Ok(true) => {
                    if let Err(e) = self.printer.connect().await {
                        error!("failed to reconnect printer: {e:#}");
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Ok(false) => {}
                Err(e) => error!("connection state query failed: {e:#}"),
            }
        }

        match self.printer.is_closed_or_error().await {
            Ok(false) => {
                if let Err(e) = self.printer.run_script(POST_ON_SCRIPT).await {
                    error!("failed to run {POST_ON_SCRIPT}: {e:#}");
                }
            }
            Ok(true) => {}
            Err(e) => error!("connection state query failed: {e:#}"),
        }
    }

    pub async fn turn_psu_off(&self) {
        let cfg = self.snapshot();
        if cfg.switching_method == SwitchingMethod::None {
            debug!("switching disabled, ignoring turn off");
            return;
        }

        let _gate = self.switch_gate.lock().await;

        // hook pré-coupure côté hôte, uniquement si connecté
        if let Ok(false) = self.printer.is_closed_or_error().await {
            if let Err(e) = self.printer.run_script(PRE_OFF_SCRIPT).await {
                error!("failed to run {PRE_OFF_SCRIPT}: {e:#}");
            }
        }

        info!("Switching PSU Off");
        match cfg.switching_method {
            SwitchingMethod::Gcode => {
                debug!("Switching PSU Off Using GCODE: {}", cfg.off_gcode_command);
                if let Err(e) = self.printer.send_gcode(&[cfg.off_gcode_command.clone()]).await {
                    error!("failed to send off G-code: {e:#}");
                }
            }
            SwitchingMethod::System => {
                debug!("Switching PSU Off Using SYSTEM: {}", cfg.off_system_command);
                match run_system_command(&cfg.off_system_command).await {
                    Ok(code) => debug!("Off system command returned: {}", code),
                    Err(e) => error!("Off system command failed: {e:#}"),
                }
            }
            SwitchingMethod::Gpio => {
                debug!("Switching PSU Off Using GPIO: {}", cfg.onoff_gpio_pin);
                let level = cfg.invert_onoff_gpio_pin;
                let written = self.pins.lock().write_switch(level);
                if let Err(e) = written {
                    error!("Exception while writing GPIO line: {e:#}");
                    return;
                }
            }
            SwitchingMethod::Plugin => {
                debug!("Switching PSU Off Using PLUGIN: {}", cfg.switching_backend);
                if let Err(e) = self.registry.switch(&cfg.switching_backend, false) {
                    error!("{e}");
                    return;
                }
            }
            SwitchingMethod::None => unreachable!(),
        }

        if cfg.disconnect_on_power_off {
            if let Err(e) = self.printer.disconnect().await {
                error!("failed to disconnect printer: {e:#}");
            }
        }

        if !sensed_externally(cfg.sensing_method) {
            self.state.set_internal_tracked(false);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        self.request_check();
    }

    pub async fn toggle(&self) {
        if self.state.is_on() {
            self.turn_psu_off().await;
        } else {
            self.turn_psu_on().await;
        }
    }

    // ---- poll loop ----

    /// Une passe de réconciliation croyance <- état réel.
    pub async fn poll_once(&self) {
        let cfg = self.snapshot();
        let old = self.state.is_on();
        debug!("Polling PSU state...");

        let new = match cfg.sensing_method {
            SensingMethod::Gpio => {
                let read = self.pins.lock().read_sense();
                match read {
                    Ok(level) => level ^ cfg.invert_sense_gpio_pin,
                    Err(e) => {
                        // lecture impossible : croyance inchangée pour ce cycle
                        error!("Exception while reading GPIO line: {e:#}");
                        old
                    }
                }
            }
            SensingMethod::System => {
                match run_system_command(&cfg.sense_system_command).await {
                    Ok(0) => true,
                    Ok(1) => false,
                    Ok(code) => {
                        debug!("Sensing system command returned ambiguous code: {}", code);
                        old
                    }
                    Err(e) => {
                        error!("Sensing system command failed: {e:#}");
                        old
                    }
                }
            }
            SensingMethod::Plugin => match self.registry.read_state(&cfg.sensing_backend) {
                Ok(v) => v,
                Err(e) => {
                    error!("{e}");
                    false
                }
            },
            SensingMethod::Internal => self.state.internal_tracked(),
        };

        self.state.set_is_on(new);
        debug!("isPSUOn: {}", new);

        if new != old {
            debug!("PSU state changed, firing state change event.");
            self.events.publish("state_changed@v1", json!({ "is_on": new })).await;
            if new {
                self.start_idle_timer();
            } else {
                self.idle.stop();
            }
        }

        // diffusion inconditionnelle de la croyance courante
        self.events.publish("state@v1", json!({ "is_on": new })).await;
    }

    /// Boucle de fond : poll à intervalle fixe, réveillable immédiatement.
    /// `changed()` marque la version vue : une rafale de réveils pendant le
    /// sommeil ne produit qu'un seul re-poll.
    pub fn spawn_state_poller(&self) {
        let Some(me) = self.handle() else { return };
        let mut wake = self.poll_wake.subscribe();
        tokio::spawn(async move {
            loop {
                me.poll_once().await;
                let interval = me.snapshot().poll_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = wake.changed() => {}
                }
            }
        });
    }

    // ---- idle ----

    pub fn start_idle_timer(&self) {
        self.idle.stop();

        let cfg = self.snapshot();
        if cfg.power_off_when_idle && self.state.is_on() {
            let Some(me) = self.handle() else { return };
            let fire: FireFn = Arc::new(move || {
                let me = Arc::clone(&me);
                Box::pin(async move { me.idle_poweroff().await })
            });
            self.idle.start(cfg.idle_timeout_duration(), fire);
        }
    }

    fn reset_idle_timer(&self) {
        if !self.idle.reset(None) {
            self.start_idle_timer();
        }
    }

    /// Déclenché par l'expiration du timer idle.
    pub async fn idle_poweroff(&self) {
        let cfg = self.snapshot();
        if !cfg.power_off_when_idle {
            return;
        }
        if self.state.wait_for_heaters() {
            return;
        }
        // vérifié au déclenchement, pas à l'armement : une impression
        // démarrée entre-temps bloque la coupure
        match self.printer.is_printing_or_paused().await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                error!("job state query failed, keeping PSU on: {e:#}");
                return;
            }
        }

        info!(
            "Idle timeout reached after {} minute(s). Turning heaters off prior to shutting off PSU.",
            cfg.idle_timeout
        );
        if self.wait_for_heaters_cooldown(&cfg).await {
            info!("Heaters below temperature.");
            self.turn_psu_off().await;
        } else {
            info!("Aborted PSU shut down due to activity.");
        }
    }

    /// Coupe les heaters encore actifs puis attend qu'ils repassent sous le
    /// seuil. Retourne false si l'attente a été interrompue par de l'activité.
    async fn wait_for_heaters_cooldown(&self, cfg: &PsuConfig) -> bool {
        self.state.set_wait_for_heaters(true);

        match self.printer.current_temperatures().await {
            Ok(heaters) => {
                for (heater, entry) in heaters {
                    match entry.target {
                        Some(target) if target != 0.0 => {
                            info!("Turning off heater: {}", heater);
                            self.state.set_skip_idle_reset(true);
                            if let Err(e) = self.printer.set_temperature(&heater, 0.0).await {
                                error!("failed to turn off heater {}: {e:#}", heater);
                            }
                            self.state.set_skip_idle_reset(false);
                        }
                        Some(_) => debug!("Heater {} already off.", heater),
                        None => {}
                    }
                }
            }
            Err(e) => error!("temperature query failed: {e:#}"),
        }

        loop {
            if !self.state.wait_for_heaters() {
                return false;
            }

            let heaters = match self.printer.current_temperatures().await {
                Ok(h) => h,
                Err(e) => {
                    error!("temperature query failed, still waiting: {e:#}");
                    tokio::time::sleep(HEATER_POLL).await;
                    continue;
                }
            };

            let mut highest = 0.0_f64;
            let mut hot: Vec<String> = Vec::new();
            for (heater, entry) in &heaters {
                if !heater.starts_with("tool") {
                    continue;
                }
                let Some(actual) = entry.actual else { continue };
                debug!("Heater {} = {}C", heater, actual);
                if actual > cfg.idle_timeout_wait_temp {
                    hot.push(heater.clone());
                }
                if actual > highest {
                    highest = actual;
                }
            }

            if highest <= cfg.idle_timeout_wait_temp {
                self.state.set_wait_for_heaters(false);
                return true;
            }

            info!("Waiting for heaters({}) before shutting off PSU...", hot.join(", "));
            tokio::time::sleep(HEATER_POLL).await;
        }
    }

    // ---- flux de commandes ----

    /// Observe une commande G-code avant son envoi au firmware.
    /// Doit rester rapide : les commutations partent en task.
    pub fn observe_gcode(&self, line: &str) -> QueuingVerdict {
        let Some(verb) = line.split_whitespace().next() else {
            return QueuingVerdict::Pass;
        };
        let cfg = self.snapshot();
        let mut verdict = QueuingVerdict::Pass;

        if cfg.enable_pseudo_on_off {
            if verb == cfg.pseudo_on_gcode_command {
                if let Some(me) = self.handle() {
                    tokio::spawn(async move { me.turn_psu_on().await });
                }
                verdict = QueuingVerdict::Drop;
            } else if verb == cfg.pseudo_off_gcode_command {
                if let Some(me) = self.handle() {
                    tokio::spawn(async move { me.turn_psu_off().await });
                }
                verdict = QueuingVerdict::Drop;
            }
        }

        if !self.state.is_on() && cfg.auto_on && cfg.auto_on_set.contains(verb) {
            info!("Auto-On - Turning PSU On (Triggered by {})", verb);
            if let Some(me) = self.handle() {
                tokio::spawn(async move { me.turn_psu_on().await });
            }
        }

        if cfg.power_off_when_idle && self.state.is_on() && !self.state.skip_idle_reset() {
            if !cfg.idle_ignore_set.contains(verb) {
                self.state.set_wait_for_heaters(false);
                self.reset_idle_timer();
            }
        }

        verdict
    }

    // ---- événements hôte ----

    pub async fn on_host_event(&self, event: &str) {
        match event {
            "client_opened" => {
                self.events
                    .publish("state@v1", json!({ "is_on": self.state.is_on() }))
                    .await;
            }
            "error" => {
                if self.snapshot().turn_off_when_error {
                    info!("Firmware or communication error detected. Turning PSU Off");
                    self.turn_psu_off().await;
                }
            }
            other => debug!("ignoring host event {}", other),
        }
    }

    // ---- configuration ----

    /// Applique un nouveau snapshot : broches reconfigurées, timer relancé,
    /// re-poll immédiat. Seul point de remise à zéro complet.
    pub fn apply_config(&self, mut new_cfg: PsuConfig) {
        {
            let mut pins = self.pins.lock();
            pins.release();
            match PinBank::configure(&new_cfg) {
                Ok(bank) => *pins = bank,
                Err(e) => {
                    if new_cfg.switching_method == SwitchingMethod::Gpio {
                        error!("Unable to use GPIO for switching: {e:#}");
                        new_cfg.switching_method = SwitchingMethod::None;
                    }
                    if new_cfg.sensing_method == SensingMethod::Gpio {
                        error!("Unable to use GPIO for sensing: {e:#}");
                        new_cfg.sensing_method = SensingMethod::Internal;
                    }
                    *pins = PinBank::empty();
                }
            }
        }

        *self.cfg.lock() = new_cfg;
        self.start_idle_timer();
        self.request_check();
    }
}

fn sensed_externally(method: SensingMethod) -> bool {
    matches!(
        method,
        SensingMethod::Gpio | SensingMethod::System | SensingMethod::Plugin
    )
}

/// Exécute une commande shell et attend sa fin, sans timeout.
async fn run_system_command(command: &str) -> anyhow::Result<i32> {
    if command.trim().is_empty() {
        anyhow::bail!("no command configured");
    }
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .await?;
    Ok(status.code().unwrap_or(-1))
}
