#![no_main]
#![no_std]

use core::sync::atomic::{AtomicU16, Ordering};

use defmt_rtt as _;
use panic_probe as _;

use hal::{
    self,
    clocks::Clocks,
    gpio::Pin,
    pac,
    timer::{
        Alignment, CaptureCompareDma, CountDir, Timer, TimerConfig, TimerInterrupt, UpdateReqSrc,
    },
};

use buckreg_algo::{io::AnalogReader, PowerController, TickInputs};

use cortex_m;

/// Latest raw inductor-current sample, written by the per-switching-cycle
/// interrupt and read once per base-rate tick. A single atomic cell, so the
/// read can never observe a torn value.
static LATEST_INDUCTOR: AtomicU16 = AtomicU16::new(0);

/// Base-rate scheduler tick frequency.
const TICK_FREQ_HZ: f32 = 980.0;

#[rtic::app(device = pac, peripherals = true, dispatchers = [TIM7])]
mod app {
    use super::*;

    use buckreg_drivers::*;

    #[shared]
    struct Shared {
        adc: adc::ConverterAdc,
        pwm: pwm::PwmOutput,
    }

    #[local]
    struct Local {
        tick_timer: Timer<pac::TIM3>,
        ctrl: PowerController,
        trip_inductor: Pin,
        trip_switch: Pin,
        setpoint_select: Pin,
        latch_clear: Pin,
    }

    #[init]
    fn init(ctx: init::Context) -> (Shared, Local) {
        let dp = ctx.device;
        let clock_cfg = Clocks::default();
        clock_cfg.setup().unwrap();
        defmt::debug!(
            "SYSTEM: Clock frequency is {} MHz",
            clock_cfg.sysclk() / 1_000_000
        );

        init_analog_pins();
        let trip_inductor = pinout::converter::TRIP_INDUCTOR.init();
        let trip_switch = pinout::converter::TRIP_SWITCH.init();
        let mode_select = pinout::converter::MODE_SELECT.init();
        let setpoint_select = pinout::converter::SETPOINT_SELECT.init();
        let mut latch_clear = pinout::converter::LATCH_CLEAR.init();

        let adc = adc::ConverterAdc::new(dp.ADC1, &clock_cfg);

        let mut pwm = pwm::PwmOutput::new(dp.TIM2, &clock_cfg);
        pwm.begin();

        // Reset the external overcurrent latches: the clear line must sit low
        // for at least a microsecond before re-arming.
        latch_clear.set_low();
        cortex_m::asm::delay(3400); // ~20 us
        latch_clear.set_high();

        let mut tick_timer = Timer::new_tim3(
            dp.TIM3,
            TICK_FREQ_HZ,
            TimerConfig {
                one_pulse_mode: false,
                update_request_source: UpdateReqSrc::Any,
                auto_reload_preload: true,
                alignment: Alignment::Edge,
                capture_compare_dma: CaptureCompareDma::Update,
                direction: CountDir::Up,
            },
            &clock_cfg,
        );
        tick_timer.enable_interrupt(TimerInterrupt::Update);
        tick_timer.enable();

        // The mode jumper is sampled exactly once; all later mode changes
        // come from the protection monitor.
        let mut ctrl = PowerController::new();
        ctrl.select_startup_mode(mode_select.is_high());

        (
            Shared { adc, pwm },
            Local {
                tick_timer,
                ctrl,
                trip_inductor,
                trip_switch,
                setpoint_select,
                latch_clear,
            },
        )
    }

    fn init_analog_pins() {
        pinout::converter::OUTPUT_VOLTAGE.init();
        pinout::converter::SWITCH_CURRENT.init();
        pinout::converter::INDUCTOR_CURRENT.init();
        pinout::converter::DUTY_POT.init();
        pinout::converter::FREQ_POT.init();
    }

    /// Base-rate scheduler tick at 980 Hz. Everything the converter does
    /// happens inside this handler; the returned actuation pair is written
    /// to the PWM peripheral before the handler returns.
    #[task(binds = TIM3, shared = [adc, pwm], local = [
        tick_timer, ctrl, trip_inductor, trip_switch, setpoint_select, latch_clear
    ])]
    fn tick(mut cx: tick::Context) {
        cx.local.tick_timer.clear_interrupt(TimerInterrupt::Update);

        let inputs = TickInputs {
            inductor_sample: LATEST_INDUCTOR.load(Ordering::Relaxed),
            inductor_trip_line: cx.local.trip_inductor.is_high(),
            switch_trip_line: cx.local.trip_switch.is_high(),
            setpoint_select: cx.local.setpoint_select.is_high(),
        };

        let ctrl = &mut *cx.local.ctrl;
        let output = cx.shared.adc.lock(|adc| ctrl.tick(inputs, adc));

        if output.rearm_latch {
            cx.local.latch_clear.set_high();
        }
        cx.shared.pwm.lock(|pwm| pwm.apply(output.actuation));
    }

    /// Fires on the PWM timer's update event, once per switching cycle, so
    /// the inductor current is always sampled at the same phase of the
    /// waveform instead of somewhere inside a switching transient.
    #[task(binds = TIM2, shared = [adc, pwm])]
    fn switching_cycle(mut cx: switching_cycle::Context) {
        cx.shared
            .pwm
            .lock(|pwm| pwm.get_timer().clear_interrupt(TimerInterrupt::Update));

        let sample = cx.shared.adc.lock(|adc| adc.read_fast());
        LATEST_INDUCTOR.store(sample, Ordering::Relaxed);
    }
}

#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
