use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use pretty_assertions::assert_eq;

use idflash::device::{Category, Family};
use idflash::flashing::{ErrorMode, JLinkFlasher, Stage, StLinkFlasher};
use idflash::runner::ToolOutput;
use idflash::{
    Backend, BackendKind, DeviceDb, DeviceDescriptor, Error, FlashJob, FlashOptions, Flasher,
    Identity, Image, Processor, Result, ToolCommand, ToolRunner,
};

type Reply = Box<dyn FnMut(&ToolCommand) -> ToolOutput>;

/// Records every command and answers through a closure.
struct Bench {
    calls: Rc<RefCell<Vec<ToolCommand>>>,
    reply: Reply,
}

impl Bench {
    fn new(reply: impl FnMut(&ToolCommand) -> ToolOutput + 'static) -> (Self, Rc<RefCell<Vec<ToolCommand>>>) {
        let calls = Rc::new(RefCell::new(vec![]));
        let bench = Bench {
            calls: calls.clone(),
            reply: Box::new(reply),
        };
        (bench, calls)
    }

    fn passing() -> (Self, Rc<RefCell<Vec<ToolCommand>>>) {
        Self::new(|_| ok())
    }
}

impl ToolRunner for Bench {
    fn execute(&mut self, command: &ToolCommand) -> Result<ToolOutput> {
        self.calls.borrow_mut().push(command.clone());
        Ok((self.reply)(command))
    }
}

fn ok() -> ToolOutput {
    ToolOutput {
        code: Some(0),
        output: String::new(),
    }
}

fn failed(output: &str) -> ToolOutput {
    ToolOutput {
        code: Some(1),
        output: output.to_string(),
    }
}

fn has(command: &ToolCommand, arg: &str) -> bool {
    command.args.iter().any(|a| a == arg)
}

/// stm8flash section of a write or read command.
fn section(command: &ToolCommand) -> Option<&str> {
    let i = command.args.iter().position(|a| a == "-s")?;
    command.args.get(i + 1).map(String::as_str)
}

struct Setup {
    _sources: tempfile::TempDir,
    work: tempfile::TempDir,
    firmware: PathBuf,
}

impl Setup {
    fn new(firmware_name: &str, image: &Image) -> Self {
        let sources = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let firmware = sources.path().join(firmware_name);
        image.save(&firmware).unwrap();
        Setup {
            _sources: sources,
            work,
            firmware,
        }
    }

    fn job(&self, device: DeviceDescriptor) -> FlashJob {
        FlashJob::new(device, &self.firmware, None, self.work.path()).unwrap()
    }

    fn options(&self) -> FlashOptions {
        FlashOptions {
            work_dir: self.work.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn work_is_empty(&self) -> bool {
        fs::read_dir(self.work.path()).unwrap().next().is_none()
    }
}

fn socket() -> DeviceDescriptor {
    DeviceDb::load().unwrap().find("Socket").unwrap()
}

fn stm8_firmware() -> Image {
    Image::from_binary(&[0xaa; 64], 0x8000)
}

#[test]
fn stm8_sequence_writes_identity_into_firmware() {
    let setup = Setup::new("socket_0x8100.hex", &stm8_firmware());
    let flashed = Rc::new(RefCell::new(None));
    let seen = flashed.clone();
    let (runner, calls) = Bench::new(move |cmd| {
        if section(cmd) == Some("flash") {
            *seen.borrow_mut() = Some(Image::load(cmd.args.last().unwrap()).unwrap());
        }
        ok()
    });
    let identity = Identity::parse("1ABC2D").unwrap().with_color(Some(2));
    let backend = Backend::new(BackendKind::StLink, runner, setup.job(socket()), identity, setup.options());
    assert!(backend.job().work_dir().is_dir());
    assert_eq!(backend.job().firmware, setup.firmware);

    assert!(backend.run().unwrap());

    let calls = calls.borrow();
    assert_eq!(calls.len(), 3);
    assert!(has(&calls[0], "-u"));
    assert_eq!(section(&calls[1]), Some("flash"));
    assert_eq!(section(&calls[2]), Some("opt"));

    let image = flashed.borrow_mut().take().unwrap();
    assert_eq!(
        image.read(0x8100..0x8106),
        vec![Some(0x1a), Some(0xbc), Some(0x2d), Some(0x00), None, Some(0x02)]
    );
    assert_eq!(image.get(0x8000), Some(0xaa));
    assert!(setup.work_is_empty());
}

#[test]
fn out_of_range_line_is_removed_and_flash_retried_once() {
    let setup = Setup::new("socket_0x8100.hex", &stm8_firmware());
    let retried = Rc::new(RefCell::new(None));
    let seen = retried.clone();
    let mut flashes = 0;
    let (runner, calls) = Bench::new(move |cmd| {
        if section(cmd) != Some("flash") {
            return ok();
        }
        flashes += 1;
        if flashes == 1 {
            return failed("Address 8010 is out of range at line 2\nTries exceeded\n");
        }
        *seen.borrow_mut() = Some(Image::load(cmd.args.last().unwrap()).unwrap());
        ok()
    });
    let identity = Identity::parse("1ABC2D").unwrap();
    let backend = Backend::new(BackendKind::StLink, runner, setup.job(socket()), identity, setup.options());

    assert!(backend.run().unwrap());

    let flash_calls = calls.borrow().iter().filter(|c| section(c) == Some("flash")).count();
    assert_eq!(flash_calls, 2);
    let image = retried.borrow_mut().take().unwrap();
    assert_eq!(image.get(0x800f), Some(0xaa));
    assert_eq!(image.read(0x8010..0x8020), vec![None; 16]);
    assert_eq!(image.get(0x8020), Some(0xaa));
    assert_eq!(image.get(0x8100), Some(0x1a));
    // the caller's file is left alone
    assert_eq!(Image::load(&setup.firmware).unwrap(), stm8_firmware());
}

#[test]
fn out_of_range_twice_is_an_error() {
    let setup = Setup::new("socket_0x8100.hex", &stm8_firmware());
    let (runner, calls) = Bench::new(|cmd| match section(cmd) {
        Some("flash") => failed("Address 8010 is out of range at line 2\n"),
        _ => ok(),
    });
    let identity = Identity::parse("1ABC2D").unwrap();
    let mut flasher = StLinkFlasher::new(runner, setup.job(socket()), identity, setup.options());
    assert_eq!(flasher.stage(), Stage::Idle);

    flasher.setup().unwrap();
    match flasher.flash() {
        Err(Error::OutOfRange { lines, .. }) => assert_eq!(lines, vec![2]),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(flasher.stage(), Stage::RetryFlash);
    drop(flasher);

    let calls = calls.borrow();
    assert_eq!(calls.iter().filter(|c| section(c) == Some("flash")).count(), 2);
    // never locked
    assert!(!calls.iter().any(|c| section(c) == Some("opt")));
    assert!(setup.work_is_empty());
}

#[test]
fn several_out_of_range_lines_are_removed_in_one_pass() {
    let setup = Setup::new("socket_0x8100.hex", &stm8_firmware());
    let retried = Rc::new(RefCell::new(None));
    let seen = retried.clone();
    let mut flashes = 0;
    let (runner, calls) = Bench::new(move |cmd| {
        if section(cmd) != Some("flash") {
            return ok();
        }
        flashes += 1;
        if flashes == 1 {
            // 1..4: 0x8000..0x8040, 5: identity, 6: EOF
            return failed(
                "Address 8010 is out of range at line 2\n\
                 Address 8030 is out of range at line 4\n\
                 Address 8010 is out of range at line 2\n",
            );
        }
        *seen.borrow_mut() = Some(Image::load(cmd.args.last().unwrap()).unwrap());
        ok()
    });
    let identity = Identity::parse("1ABC2D").unwrap();
    let mut flasher = StLinkFlasher::new(runner, setup.job(socket()), identity, setup.options());

    flasher.setup().unwrap();
    assert!(flasher.commands().is_some_and(|c| c.eeprom.is_none()));
    assert!(flasher.flash().unwrap());
    assert_eq!(flasher.stage(), Stage::Done);
    drop(flasher);

    assert_eq!(calls.borrow().iter().filter(|c| section(c) == Some("flash")).count(), 2);
    let image = retried.borrow_mut().take().unwrap();
    assert_eq!(image.read(0x8000..0x8010), vec![Some(0xaa); 16]);
    assert_eq!(image.read(0x8010..0x8020), vec![None; 16]);
    assert_eq!(image.read(0x8020..0x8030), vec![Some(0xaa); 16]);
    assert_eq!(image.read(0x8030..0x8040), vec![None; 16]);
    assert_eq!(image.read(0x8100..0x8104), vec![Some(0x1a), Some(0xbc), Some(0x2d), Some(0x00)]);
    assert_eq!(image.len(), 36);
}

#[test]
fn openocd_retry_uses_trimmed_copy() {
    let setup = Setup::new("hub_0x08000100.hex", &Image::from_binary(&[0x22; 64], 0x0800_0000));
    let retried = Rc::new(RefCell::new(None));
    let seen = retried.clone();
    let mut flashes = 0;
    let (runner, _calls) = Bench::new(move |cmd| {
        let Some(arg) = cmd.args.iter().find(|a| a.starts_with("flash write_image erase ")) else {
            return ok();
        };
        flashes += 1;
        if flashes == 1 {
            // 1: ELA, 2..5: 0x08000000..0x08000040, 6: identity, 7: EOF
            return failed(
                "Error: Address 10 is out of range at line 3\n\
                 Error: Address 30 is out of range at line 5\n",
            );
        }
        let path = PathBuf::from(arg.trim_start_matches("flash write_image erase "));
        *seen.borrow_mut() = Some((path.clone(), Image::load(&path).unwrap()));
        ok()
    });
    let device = DeviceDescriptor::new("Hub", Processor::Stm32f1x, Family::Radio(Category::Intrusion));
    let identity = Identity::parse("1ABC2D3E").unwrap();
    let backend = Backend::new(BackendKind::StLink, runner, setup.job(device), identity, setup.options());

    assert!(backend.run().unwrap());

    let (path, image) = retried.borrow_mut().take().unwrap();
    assert!(path.is_absolute());
    assert!(path.ends_with("firmware_to_flash.hex"));
    assert_eq!(image.read(0x0800_0010..0x0800_0020), vec![None; 16]);
    assert_eq!(image.read(0x0800_0030..0x0800_0040), vec![None; 16]);
    assert_eq!(image.get(0x0800_0000), Some(0x22));
    assert_eq!(image.get(0x0800_0020), Some(0x22));
    assert_eq!(
        image.read(0x0800_0100..0x0800_0104),
        vec![Some(0x3e), Some(0x2d), Some(0xbc), Some(0x1a)]
    );
    assert_eq!(image.len(), 36);
    assert!(setup.work_is_empty());
}

#[test]
fn out_of_range_without_data_is_not_retried() {
    let setup = Setup::new("socket_0x8100.hex", &stm8_firmware());
    let (runner, calls) = Bench::new(|cmd| match section(cmd) {
        // line 6 is the end-of-file record, line 9 does not exist
        Some("flash") => failed("Address 8100 is out of range at line 6\nAddress 8200 is out of range at line 9\n"),
        _ => ok(),
    });
    let identity = Identity::parse("1ABC2D").unwrap();
    let mut flasher = StLinkFlasher::new(runner, setup.job(socket()), identity, setup.options());

    flasher.setup().unwrap();
    match flasher.flash() {
        Err(Error::OutOfRange { lines, .. }) => assert_eq!(lines, vec![6, 9]),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(flasher.stage(), Stage::Flashing);
    drop(flasher);
    assert_eq!(calls.borrow().iter().filter(|c| section(c) == Some("flash")).count(), 1);
}

#[test]
fn identity_past_address_space_fails_before_programming() {
    let setup = Setup::new("socket_0xFFFFFFFE.hex", &stm8_firmware());
    let (runner, calls) = Bench::passing();
    let identity = Identity::parse("1ABC2D").unwrap();
    let backend = Backend::new(BackendKind::StLink, runner, setup.job(socket()), identity, setup.options());

    assert!(matches!(backend.run(), Err(Error::InvalidIdentity(_))));
    assert!(calls.borrow().is_empty());
    assert!(setup.work_is_empty());
}

#[test]
fn unlocked_target_skips_unlock() {
    let setup = Setup::new("socket_0x8100.hex", &stm8_firmware());
    let (runner, calls) = Bench::passing();
    let options = FlashOptions {
        unlocked: true,
        ..setup.options()
    };
    let identity = Identity::parse("1ABC2D").unwrap();
    let backend = Backend::new(BackendKind::StLink, runner, setup.job(socket()), identity, options);

    assert!(backend.run().unwrap());
    let sections: Vec<_> = calls.borrow().iter().map(|c| section(c).map(str::to_string)).collect();
    assert_eq!(sections, vec![Some("flash".to_string()), Some("opt".to_string())]);
}

#[test]
fn lenient_mode_still_locks_and_reports_failure() {
    let setup = Setup::new("socket_0x8100.hex", &stm8_firmware());
    let (runner, calls) = Bench::new(|cmd| match section(cmd) {
        Some("flash") => failed("Tries exceeded"),
        _ => ok(),
    });
    let options = FlashOptions {
        error_mode: ErrorMode::Lenient,
        tries: 2,
        ..setup.options()
    };
    let identity = Identity::parse("1ABC2D").unwrap();
    let backend = Backend::new(BackendKind::StLink, runner, setup.job(socket()), identity, options);

    assert!(!backend.run().unwrap());
    let calls = calls.borrow();
    assert_eq!(calls.iter().filter(|c| section(c) == Some("flash")).count(), 2);
    assert_eq!(calls.last().and_then(section), Some("opt"));
    assert!(setup.work_is_empty());
}

#[test]
fn strict_mode_stops_at_first_failure() {
    let setup = Setup::new("socket_0x8100.hex", &stm8_firmware());
    let (runner, calls) = Bench::new(|cmd| {
        if has(cmd, "-u") {
            failed("Tries exceeded")
        } else {
            ok()
        }
    });
    let identity = Identity::parse("1ABC2D").unwrap();
    let backend = Backend::new(BackendKind::StLink, runner, setup.job(socket()), identity, setup.options());

    assert!(matches!(backend.run(), Err(Error::CommandExecution { .. })));
    assert_eq!(calls.borrow().len(), 1);
    assert!(setup.work_is_empty());
}

#[test]
fn eeprom_identity_is_read_patched_and_written() {
    let setup = Setup::new("socket_0x1000.hex", &stm8_firmware());
    let written = Rc::new(RefCell::new(None));
    let seen = written.clone();
    let (runner, calls) = Bench::new(move |cmd| {
        let file = Path::new(cmd.args.last().unwrap());
        match (section(cmd), has(cmd, "-r")) {
            (Some("eeprom"), true) => Image::from_binary(&[0xff; 64], 0x1000).save(file).unwrap(),
            (Some("eeprom"), false) => *seen.borrow_mut() = Some(Image::load(file).unwrap()),
            _ => (),
        }
        ok()
    });
    let identity = Identity::parse("1ABC2D").unwrap();
    let backend = Backend::new(BackendKind::StLink, runner, setup.job(socket()), identity, setup.options());

    assert!(backend.run().unwrap());

    let calls = calls.borrow();
    assert_eq!(calls.len(), 5);
    assert!(has(&calls[0], "-r"));
    assert!(has(&calls[1], "-u"));
    assert_eq!(section(&calls[2]), Some("flash"));
    assert_eq!(section(&calls[3]), Some("eeprom"));
    assert_eq!(section(&calls[4]), Some("opt"));

    let eeprom = written.borrow_mut().take().unwrap();
    assert_eq!(eeprom.read(0x1000..0x1004), vec![Some(0x1a), Some(0xbc), Some(0x2d), Some(0x00)]);
    assert_eq!(eeprom.get(0x103f), Some(0xff));
}

#[test]
fn stm32_binaries_are_merged_and_id_reversed() {
    let sources = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let boot = sources.path().join("boot.bin");
    let app = sources.path().join("hub_0x08020100.bin");
    fs::write(&boot, [0x11; 32]).unwrap();
    fs::write(&app, [0x22; 512]).unwrap();

    let flashed = Rc::new(RefCell::new(None));
    let seen = flashed.clone();
    let (runner, calls) = Bench::new(move |cmd| {
        if let Some(arg) = cmd.args.iter().find(|a| a.starts_with("flash write_image erase ")) {
            let path = arg.trim_start_matches("flash write_image erase ");
            *seen.borrow_mut() = Some(Image::load(path).unwrap());
        }
        ok()
    });
    let device = DeviceDescriptor::new("Hub", Processor::Stm32f1x, Family::Radio(Category::Intrusion));
    let job = FlashJob::new(device, &app, Some(boot.clone()), work.path()).unwrap();
    let options = FlashOptions {
        work_dir: work.path().to_path_buf(),
        ..Default::default()
    };
    let identity = Identity::parse("1ABC2D3E").unwrap();

    assert!(Backend::new(BackendKind::StLink, runner, job, identity, options).run().unwrap());

    let calls = calls.borrow();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.program == "openocd"));
    assert!(calls[0].args.last().unwrap().ends_with("Hub_stm32f1x_unlock.cfg"));
    assert!(calls[2].args.last().unwrap().ends_with("Hub_stm32f1x_lock.cfg"));

    let image = flashed.borrow_mut().take().unwrap();
    assert_eq!(image.get(0x0800_0000), Some(0x11));
    assert_eq!(image.get(0x0802_0000), Some(0x22));
    assert_eq!(
        image.read(0x0802_0100..0x0802_0104),
        vec![Some(0x3e), Some(0x2d), Some(0xbc), Some(0x1a)]
    );
    assert_eq!(image.get(0x0802_0104), Some(0x22));
    assert!(fs::read_dir(work.path()).unwrap().next().is_none());
}

#[test]
fn device_without_identity_is_flashed_as_is() {
    let firmware = Image::from_binary(&[0x33; 16], 0x0800_0000);
    let setup = Setup::new("keypad.hex", &firmware);
    let flashed = Rc::new(RefCell::new(None));
    let seen = flashed.clone();
    let (runner, _calls) = Bench::new(move |cmd| {
        if let Some(arg) = cmd.args.iter().find(|a| a.starts_with("flash write_image erase ")) {
            *seen.borrow_mut() = Some(arg.clone());
        }
        ok()
    });
    let device = DeviceDb::load().unwrap().find("KeyPadPlus").unwrap();
    let identity = Identity::parse("1ABC2D").unwrap();
    let backend = Backend::new(BackendKind::StLink, runner, setup.job(device), identity, setup.options());

    assert!(backend.run().unwrap());
    assert!(flashed.borrow().as_ref().unwrap().ends_with("firmware_working.hex"));
}

#[test]
fn cc_processors_need_jlink() {
    let setup = Setup::new("fw_0x1f000.hex", &Image::from_binary(&[0; 16], 0));
    let (runner, calls) = Bench::passing();
    let device = DeviceDescriptor::new("FireProtect2", Processor::Cc1310, Family::Radio(Category::Fire));
    let identity = Identity::parse("1ABC2D3E").unwrap();
    let backend = Backend::new(BackendKind::StLink, runner, setup.job(device), identity, setup.options());

    assert!(matches!(
        backend.run(),
        Err(Error::UnsupportedProcessor { processor: "cc1310", backend: "ST-Link" })
    ));
    assert!(calls.borrow().is_empty());
}

#[test]
fn jlink_runs_generated_command_file() {
    let sources = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let firmware = sources.path().join("fw_0x1f000.hex");
    Image::from_binary(&[0x44; 64], 0).save(&firmware).unwrap();
    let boot = sources.path().join("boot.hex");
    Image::from_binary(&[0x55; 16], 0x1f000).save(&boot).unwrap();

    let script = Rc::new(RefCell::new(String::new()));
    let seen = script.clone();
    let (runner, calls) = Bench::new(move |cmd| {
        *seen.borrow_mut() = fs::read_to_string(cmd.args.last().unwrap()).unwrap();
        ok()
    });
    let device = DeviceDescriptor::new("FireProtect2", Processor::Cc1310, Family::Radio(Category::Fire));
    let job = FlashJob::new(device, &firmware, Some(boot.clone()), work.path()).unwrap();
    let options = FlashOptions {
        programmer_sn: Some("801000123".to_string()),
        work_dir: work.path().to_path_buf(),
        ..Default::default()
    };
    let identity = Identity::parse("1ABC2D3E").unwrap();

    assert!(Backend::by_name("JLink", runner, job, identity, options).unwrap().run().unwrap());

    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, "JLinkExe");
    assert_eq!(
        calls[0].args[..6],
        ["-ExitOnError", "1", "-NoGui", "1", "-USB", "801000123"]
    );
    assert!(calls[0].args.last().unwrap().ends_with("cc1310_config.jlink"));

    let script = script.borrow();
    let lines: Vec<&str> = script.lines().collect();
    assert_eq!(lines[3], "Device CC1310F128");
    assert!(lines[6].starts_with("loadfile ") && lines[6].ends_with("firmware_to_flash.hex"));
    assert_eq!(lines[7], format!("loadfile {} 0x1f000", boot.display()));
    assert_eq!(lines.last(), Some(&"Exit"));
    assert!(fs::read_dir(work.path()).unwrap().next().is_none());
}

#[test]
fn jlink_refuses_eeprom_identity() {
    let setup = Setup::new("fw_0x1000.hex", &Image::from_binary(&[0; 16], 0));
    let (runner, calls) = Bench::passing();
    let device = DeviceDescriptor::new("FireProtect2", Processor::Cc1310, Family::Radio(Category::Fire));
    let identity = Identity::parse("1ABC2D3E").unwrap();
    let backend = Backend::new(BackendKind::JLink, runner, setup.job(device), identity, setup.options());

    assert!(matches!(backend.run(), Err(Error::InvalidIdentity(_))));
    assert!(calls.borrow().is_empty());
}

#[test]
fn jlink_lenient_failure_is_reported_as_false() {
    let setup = Setup::new("keypad.hex", &Image::from_binary(&[0x33; 16], 0x0800_0000));
    let (runner, calls) = Bench::new(|_| failed("Could not connect to target."));
    let device = DeviceDb::load().unwrap().find("KeyPadPlus").unwrap();
    let options = FlashOptions {
        error_mode: ErrorMode::Lenient,
        tries: 3,
        ..setup.options()
    };
    let identity = Identity::parse("1ABC2D").unwrap();
    let mut flasher = JLinkFlasher::new(runner, setup.job(device), identity, options);
    assert!(flasher.command_file().is_none());

    flasher.setup().unwrap();
    let script = fs::read_to_string(flasher.command_file().unwrap()).unwrap();
    assert!(script.contains("Device STM32L051K8 (ALLOW OPT. BYTES)\n"));
    assert!(script.contains("w4 0x1FF80000 0xFF4400BB\n"));

    assert!(!flasher.flash().unwrap());
    assert_eq!(calls.borrow().len(), 3);
    drop(flasher);
    assert!(setup.work_is_empty());
}
