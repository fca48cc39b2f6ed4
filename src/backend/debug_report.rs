// Debug report callback - owning wrapper around VK_EXT_debug_report
//
// Responsibilities:
// - Resolve create/destroy entry points once, at registration time
// - Route validation reports to the log as `<Label> <code> - <message>`
// - Record Error reports as a sticky fault the caller checks after each submit
//
// The destroy entry point is cached so teardown never needs a fresh lookup.

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

const CREATE_CALLBACK_FN: &CStr = c"vkCreateDebugReportCallbackEXT";
const DESTROY_CALLBACK_FN: &CStr = c"vkDestroyDebugReportCallbackEXT";

/// Log target used for every validation report
pub const LOG_TARGET: &str = "vulkan";

#[derive(Debug, thiserror::Error)]
pub enum DebugReportError {
    /// The debug report extension is not loaded on this instance.
    #[error("Vulkan entry point `{0}` is not available (is VK_EXT_debug_report enabled?)")]
    MissingCapability(String),
    #[error("Failed to create debug report callback: {0}")]
    RegistrationFailed(vk::Result),
}

/// Severity of one report, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSeverity {
    Error,
    Warning,
    PerformanceWarning,
    Information,
    Debug,
}

impl ReportSeverity {
    /// Pick the most severe bit present. An empty set reads as `Debug`.
    pub fn classify(flags: vk::DebugReportFlagsEXT) -> Self {
        if flags.contains(vk::DebugReportFlagsEXT::ERROR) {
            Self::Error
        } else if flags.contains(vk::DebugReportFlagsEXT::WARNING) {
            Self::Warning
        } else if flags.contains(vk::DebugReportFlagsEXT::PERFORMANCE_WARNING) {
            Self::PerformanceWarning
        } else if flags.contains(vk::DebugReportFlagsEXT::INFORMATION) {
            Self::Information
        } else {
            Self::Debug
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Warning => "Warning",
            Self::PerformanceWarning => "Performance",
            Self::Information => "Info",
            Self::Debug => "Debug",
        }
    }

    fn log_level(self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warning | Self::PerformanceWarning => log::Level::Warn,
            Self::Information => log::Level::Info,
            Self::Debug => log::Level::Debug,
        }
    }
}

impl fmt::Display for ReportSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One line of diagnostic output.
pub fn format_report(severity: ReportSeverity, code: i32, message: &str) -> String {
    format!("{} {} - {}", severity.label(), code, message)
}

/// An Error-severity report raised during a platform call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Vulkan validation {severity} {code}: {message}")]
pub struct ValidationFault {
    pub severity: ReportSeverity,
    pub code: i32,
    pub message: String,
}

/// Written by the callback, read by the owner. Lives on the heap so its
/// address stays valid while the reporter moves around.
#[derive(Default)]
struct FaultState {
    raised: AtomicBool,
    first: Mutex<Option<ValidationFault>>,
}

impl FaultState {
    fn raise(&self, fault: ValidationFault) {
        let mut first = self.first.lock();
        // Keep the earliest error; later ones are already in the log
        if first.is_none() {
            *first = Some(fault);
        }
        self.raised.store(true, Ordering::Release);
    }

    fn take(&self) -> Option<ValidationFault> {
        if !self.raised.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.first.lock().take()
    }
}

struct Registration {
    instance: vk::Instance,
    callback: vk::DebugReportCallbackEXT,
    destroy: vk::PFN_vkDestroyDebugReportCallbackEXT,
    faults: Box<FaultState>,
}

/// Owning handle for a debug report callback.
///
/// Either empty or registered against exactly one instance. Dropping a
/// registered reporter deregisters it; it must be dropped before the
/// instance is destroyed. Not `Clone`: the registration is unique.
#[derive(Default)]
pub struct DebugReporter {
    registration: Option<Registration>,
}

impl DebugReporter {
    /// Register against a live instance, resolving entry points through the loader.
    pub fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        filter: vk::DebugReportFlagsEXT,
    ) -> Result<Self, DebugReportError> {
        let handle = instance.handle();
        Self::with_loader(handle, filter, |name| unsafe {
            entry.get_instance_proc_addr(handle, name.as_ptr())
        })
    }

    /// Register using `load` to resolve entry points by name.
    ///
    /// Both entry points are resolved before anything is registered, so any
    /// failure leaves nothing behind.
    pub fn with_loader<F>(
        instance: vk::Instance,
        filter: vk::DebugReportFlagsEXT,
        mut load: F,
    ) -> Result<Self, DebugReportError>
    where
        F: FnMut(&CStr) -> vk::PFN_vkVoidFunction,
    {
        let create_addr = resolve(&mut load, CREATE_CALLBACK_FN)?;
        let destroy_addr = resolve(&mut load, DESTROY_CALLBACK_FN)?;

        // SAFETY: the loader returned these addresses for these exact names
        let create: vk::PFN_vkCreateDebugReportCallbackEXT =
            unsafe { std::mem::transmute(create_addr) };
        let destroy: vk::PFN_vkDestroyDebugReportCallbackEXT =
            unsafe { std::mem::transmute(destroy_addr) };

        let faults = Box::new(FaultState::default());
        let user_data = &*faults as *const FaultState as *mut c_void;

        let create_info = vk::DebugReportCallbackCreateInfoEXT::builder()
            .flags(filter)
            .pfn_callback(Some(report_callback))
            .user_data(user_data);

        let mut callback = vk::DebugReportCallbackEXT::null();
        let result = unsafe { create(instance, &*create_info, std::ptr::null(), &mut callback) };
        if result != vk::Result::SUCCESS {
            return Err(DebugReportError::RegistrationFailed(result));
        }

        log::debug!("Registered debug report callback ({:?})", filter);

        Ok(Self {
            registration: Some(Registration {
                instance,
                callback,
                destroy,
                faults,
            }),
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Move the registration out, leaving `self` empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Consume the pending Error report, if any.
    pub fn take_fault(&self) -> Option<ValidationFault> {
        self.registration.as_ref().and_then(|r| r.faults.take())
    }

    /// Deregister, returning the Error report still pending, if any.
    pub fn finish(mut self) -> Result<(), ValidationFault> {
        let pending = self.take_fault();
        self.release();
        match pending {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn release(&mut self) {
        if let Some(registration) = self.registration.take() {
            log::debug!("Destroying debug report callback");
            unsafe {
                (registration.destroy)(
                    registration.instance,
                    registration.callback,
                    std::ptr::null(),
                );
            }
        }
    }
}

impl Drop for DebugReporter {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DebugReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.registration {
            Some(r) => f
                .debug_struct("DebugReporter")
                .field("instance", &r.instance.as_raw())
                .field("callback", &r.callback.as_raw())
                .finish(),
            None => f.write_str("DebugReporter(empty)"),
        }
    }
}

fn resolve<F>(load: &mut F, name: &CStr) -> Result<unsafe extern "system" fn(), DebugReportError>
where
    F: FnMut(&CStr) -> vk::PFN_vkVoidFunction,
{
    load(name).ok_or_else(|| DebugReportError::MissingCapability(name.to_string_lossy().into_owned()))
}

// Called by the validation layer, possibly from a driver thread. Must not
// unwind back into the platform, so Error reports only set the fault.
unsafe extern "system" fn report_callback(
    flags: vk::DebugReportFlagsEXT,
    _object_type: vk::DebugReportObjectTypeEXT,
    _object: u64,
    _location: usize,
    message_code: i32,
    _layer_prefix: *const c_char,
    p_message: *const c_char,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if p_message.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr(p_message).to_string_lossy()
    };

    let severity = ReportSeverity::classify(flags);
    log::log!(
        target: LOG_TARGET,
        severity.log_level(),
        "{}",
        format_report(severity, message_code, &message)
    );

    if severity == ReportSeverity::Error && !p_user_data.is_null() {
        let faults = &*(p_user_data as *const FaultState);
        faults.raise(ValidationFault {
            severity,
            code: message_code,
            message: message.into_owned(),
        });
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::sync::Once;

    type VoidFn = unsafe extern "system" fn();

    thread_local! {
        static CREATED: Cell<u32> = Cell::new(0);
        static DESTROYED: Cell<u32> = Cell::new(0);
        static LAST_DESTROYED: Cell<u64> = Cell::new(0);
        static CAPTURED: Cell<Option<(vk::PFN_vkDebugReportCallbackEXT, *mut c_void)>> = Cell::new(None);
    }

    fn reset_counters() {
        CREATED.with(|c| c.set(0));
        DESTROYED.with(|c| c.set(0));
        LAST_DESTROYED.with(|c| c.set(0));
        CAPTURED.with(|c| c.set(None));
    }

    fn created() -> u32 {
        CREATED.with(Cell::get)
    }

    fn destroyed() -> u32 {
        DESTROYED.with(Cell::get)
    }

    unsafe extern "system" fn fake_create(
        _instance: vk::Instance,
        p_create_info: *const vk::DebugReportCallbackCreateInfoEXT,
        _p_allocator: *const vk::AllocationCallbacks,
        p_callback: *mut vk::DebugReportCallbackEXT,
    ) -> vk::Result {
        let info = &*p_create_info;
        CAPTURED.with(|c| c.set(Some((info.pfn_callback, info.p_user_data))));
        let n = CREATED.with(|c| {
            c.set(c.get() + 1);
            c.get()
        });
        *p_callback = vk::DebugReportCallbackEXT::from_raw(0x1000 + n as u64);
        vk::Result::SUCCESS
    }

    unsafe extern "system" fn fake_create_rejecting(
        _instance: vk::Instance,
        _p_create_info: *const vk::DebugReportCallbackCreateInfoEXT,
        _p_allocator: *const vk::AllocationCallbacks,
        _p_callback: *mut vk::DebugReportCallbackEXT,
    ) -> vk::Result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
    }

    unsafe extern "system" fn fake_destroy(
        _instance: vk::Instance,
        callback: vk::DebugReportCallbackEXT,
        _p_allocator: *const vk::AllocationCallbacks,
    ) {
        DESTROYED.with(|c| c.set(c.get() + 1));
        LAST_DESTROYED.with(|c| c.set(callback.as_raw()));
    }

    fn as_void(f: vk::PFN_vkCreateDebugReportCallbackEXT) -> VoidFn {
        unsafe { std::mem::transmute(f) }
    }

    fn loader(
        create: Option<vk::PFN_vkCreateDebugReportCallbackEXT>,
        destroy: bool,
    ) -> impl FnMut(&CStr) -> vk::PFN_vkVoidFunction {
        move |name: &CStr| {
            if name == CREATE_CALLBACK_FN {
                create.map(as_void)
            } else if name == DESTROY_CALLBACK_FN && destroy {
                let f: vk::PFN_vkDestroyDebugReportCallbackEXT = fake_destroy;
                Some(unsafe { std::mem::transmute::<_, VoidFn>(f) })
            } else {
                None
            }
        }
    }

    fn instance() -> vk::Instance {
        vk::Instance::from_raw(0xabc)
    }

    fn default_filter() -> vk::DebugReportFlagsEXT {
        vk::DebugReportFlagsEXT::ERROR
            | vk::DebugReportFlagsEXT::WARNING
            | vk::DebugReportFlagsEXT::PERFORMANCE_WARNING
    }

    fn register() -> DebugReporter {
        DebugReporter::with_loader(instance(), default_filter(), loader(Some(fake_create), true))
            .unwrap()
    }

    thread_local! {
        static LINES: RefCell<Vec<(log::Level, String)>> = RefCell::new(Vec::new());
    }

    /// Keeps records on the `vulkan` target, per test thread.
    struct CaptureLogger;

    impl log::Log for CaptureLogger {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.target() == LOG_TARGET
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                LINES.with(|l| l.borrow_mut().push((record.level(), record.args().to_string())));
            }
        }

        fn flush(&self) {}
    }

    fn capture_lines() {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            log::set_boxed_logger(Box::new(CaptureLogger)).unwrap();
            log::set_max_level(log::LevelFilter::Trace);
        });
        LINES.with(|l| l.borrow_mut().clear());
    }

    fn captured_lines() -> Vec<(log::Level, String)> {
        LINES.with(|l| l.borrow_mut().drain(..).collect())
    }

    /// Invoke the callback the way the layer would, using what was captured at registration.
    fn emit(flags: vk::DebugReportFlagsEXT, code: i32, message: &CStr) -> vk::Bool32 {
        let (callback, user_data) = CAPTURED.with(Cell::get).expect("no callback registered");
        let callback = callback.expect("null callback");
        unsafe {
            callback(
                flags,
                vk::DebugReportObjectTypeEXT::UNKNOWN,
                0,
                0,
                code,
                c"Validation".as_ptr(),
                message.as_ptr(),
                user_data,
            )
        }
    }

    #[test]
    fn registers_and_deregisters_once() {
        reset_counters();
        let reporter = register();
        assert!(reporter.is_registered());
        assert_eq!(created(), 1);

        drop(reporter);
        assert_eq!(destroyed(), 1);
        assert_eq!(LAST_DESTROYED.with(Cell::get), 0x1001);
    }

    #[test]
    fn empty_reporter_drops_without_platform_call() {
        reset_counters();
        let reporter = DebugReporter::default();
        assert!(!reporter.is_registered());
        assert!(reporter.take_fault().is_none());
        drop(reporter);
        assert_eq!(destroyed(), 0);
    }

    #[test]
    fn take_leaves_source_empty() {
        reset_counters();
        let mut source = register();
        let moved = source.take();

        assert!(moved.is_registered());
        assert!(!source.is_registered());

        drop(source);
        assert_eq!(destroyed(), 0);
        drop(moved);
        assert_eq!(destroyed(), 1);
    }

    #[test]
    fn assigning_over_registered_releases_it_first() {
        reset_counters();
        let mut target = register();
        let incoming = register();
        assert_eq!(created(), 2);
        assert!(target.is_registered());

        target = incoming;
        assert_eq!(destroyed(), 1);
        assert_eq!(LAST_DESTROYED.with(Cell::get), 0x1001);
        assert!(target.is_registered());

        drop(target);
        assert_eq!(destroyed(), 2);
        assert_eq!(LAST_DESTROYED.with(Cell::get), 0x1002);
    }

    #[test]
    fn missing_create_entry_point() {
        reset_counters();
        let err = DebugReporter::with_loader(instance(), default_filter(), loader(None, true))
            .unwrap_err();
        match err {
            DebugReportError::MissingCapability(name) => {
                assert_eq!(name, "vkCreateDebugReportCallbackEXT")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(created(), 0);
        assert_eq!(destroyed(), 0);
    }

    #[test]
    fn missing_destroy_entry_point_fails_before_registering() {
        reset_counters();
        let err = DebugReporter::with_loader(
            instance(),
            default_filter(),
            loader(Some(fake_create), false),
        )
        .unwrap_err();
        assert!(matches!(err, DebugReportError::MissingCapability(ref n) if n == "vkDestroyDebugReportCallbackEXT"));
        assert_eq!(created(), 0);
    }

    #[test]
    fn rejected_registration() {
        reset_counters();
        let err = DebugReporter::with_loader(
            instance(),
            default_filter(),
            loader(Some(fake_create_rejecting), true),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DebugReportError::RegistrationFailed(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
        assert_eq!(destroyed(), 0);
    }

    #[test]
    fn classify_precedence() {
        type F = vk::DebugReportFlagsEXT;
        assert_eq!(ReportSeverity::classify(F::ERROR | F::WARNING), ReportSeverity::Error);
        assert_eq!(
            ReportSeverity::classify(F::WARNING | F::PERFORMANCE_WARNING),
            ReportSeverity::Warning
        );
        assert_eq!(
            ReportSeverity::classify(F::PERFORMANCE_WARNING | F::INFORMATION | F::DEBUG),
            ReportSeverity::PerformanceWarning
        );
        assert_eq!(
            ReportSeverity::classify(F::INFORMATION | F::DEBUG),
            ReportSeverity::Information
        );
        assert_eq!(ReportSeverity::classify(F::DEBUG), ReportSeverity::Debug);
        assert_eq!(ReportSeverity::classify(F::empty()), ReportSeverity::Debug);
    }

    #[test]
    fn report_line_format() {
        assert_eq!(
            format_report(ReportSeverity::Warning, 12, "image layout mismatch"),
            "Warning 12 - image layout mismatch"
        );
        assert_eq!(
            format_report(ReportSeverity::PerformanceWarning, -3, "slow path"),
            "Performance -3 - slow path"
        );
    }

    #[test]
    fn warning_does_not_fault_but_error_does() {
        reset_counters();
        let reporter = register();

        assert_eq!(emit(vk::DebugReportFlagsEXT::WARNING, 4, c"minor"), vk::FALSE);
        assert!(reporter.take_fault().is_none());

        assert_eq!(emit(vk::DebugReportFlagsEXT::ERROR, 9, c"bad handle"), vk::FALSE);
        let fault = reporter.take_fault().expect("error should raise a fault");
        assert_eq!(fault.severity, ReportSeverity::Error);
        assert_eq!(fault.code, 9);
        assert_eq!(fault.message, "bad handle");
        assert_eq!(fault.to_string(), "Vulkan validation Error 9: bad handle");

        // consumed
        assert!(reporter.take_fault().is_none());
    }

    #[test]
    fn first_error_wins_until_taken() {
        reset_counters();
        let reporter = register();
        emit(vk::DebugReportFlagsEXT::ERROR, 1, c"first");
        emit(vk::DebugReportFlagsEXT::ERROR | vk::DebugReportFlagsEXT::WARNING, 2, c"second");

        let fault = reporter.take_fault().unwrap();
        assert_eq!(fault.code, 1);
        assert_eq!(fault.message, "first");
    }

    #[test]
    fn fault_state_follows_a_moved_reporter() {
        reset_counters();
        let mut source = register();
        let moved = source.take();

        emit(vk::DebugReportFlagsEXT::ERROR, 5, c"after move");
        assert!(source.take_fault().is_none());
        assert_eq!(moved.take_fault().map(|f| f.code), Some(5));
    }

    #[test]
    fn callback_writes_one_line_per_report() {
        reset_counters();
        capture_lines();
        let reporter = register();

        emit(vk::DebugReportFlagsEXT::WARNING, 4, c"minor");
        assert_eq!(captured_lines(), vec![(log::Level::Warn, "Warning 4 - minor".to_string())]);
        assert!(reporter.take_fault().is_none());

        emit(vk::DebugReportFlagsEXT::ERROR, 9, c"bad handle");
        assert_eq!(captured_lines(), vec![(log::Level::Error, "Error 9 - bad handle".to_string())]);
        assert_eq!(reporter.take_fault().map(|f| f.code), Some(9));

        emit(vk::DebugReportFlagsEXT::DEBUG, 0, c"loader trace");
        assert_eq!(captured_lines(), vec![(log::Level::Debug, "Debug 0 - loader trace".to_string())]);
    }

    #[test]
    fn finish_returns_pending_error_and_deregisters() {
        reset_counters();
        let reporter = register();
        emit(vk::DebugReportFlagsEXT::ERROR, 12, c"leaked buffer");

        let fault = reporter.finish().unwrap_err();
        assert_eq!(fault.code, 12);
        assert_eq!(fault.message, "leaked buffer");
        assert_eq!(destroyed(), 1);
    }

    #[test]
    fn finish_is_ok_without_errors() {
        reset_counters();
        let reporter = register();
        emit(vk::DebugReportFlagsEXT::WARNING, 1, c"noise");
        assert!(reporter.finish().is_ok());
        assert_eq!(destroyed(), 1);

        assert!(DebugReporter::default().finish().is_ok());
        assert_eq!(destroyed(), 1);
    }
}
