//! USB Mass Storage device exposing an SPI NOR flash chip as a FAT disk
//!
//! The host reads and writes the flash through the SCSI transparent command
//! set over Bulk-Only Transport, while the firmware lists the files on the
//! same volume over RTT every two seconds.
//!
//! Target: STM32H743VIT6 (MicoAir H743 board)
//! USB: PA11 (DM) / PA12 (DP) -> USB2 (OTG2_HS)
//! Flash: 25-series SPI NOR on SPI1 (PA5 SCK, PA6 MISO, PA7 MOSI, PA4 CS)
//! LED: PE6, lit while host writes are not yet committed to flash

#![no_std]
#![no_main]

use core::borrow::{Borrow, BorrowMut};
use core::cell::RefCell;
use core::mem::MaybeUninit;

use cortex_m::peripheral::DWT;
use cortex_m_rt::entry;
use defmt::*;
use defmt_rtt as _;
use panic_probe as _;

use stm32h7xx_hal::gpio::{self, Output, PushPull};
use stm32h7xx_hal::rcc::rec::UsbClkSel;
use stm32h7xx_hal::usb_hs::{UsbBus, USB2};
use stm32h7xx_hal::{pac, prelude::*, spi};

use usb_device::prelude::*;
use usbd_storage::subclass::scsi::Scsi;

use flash_msc::config::{
    IDENTITY, LIST_INTERVAL_MS, PACKET_SIZE, USB_MANUFACTURER, USB_PID, USB_PRODUCT,
    USB_SERIAL, USB_VID,
};
use flash_msc::diag::LineWriter;
use flash_msc::interval::Interval;
use flash_msc::list::ListError;
use flash_msc::spi_nor::SpiNor;
use flash_msc::{
    list_files, ActivityLed, BlockDevice, Bridge, CachedFlash, FatView, FixedTime, MscHandler,
    ScsiDisk,
};

/// Core clock, also the rate of the DWT cycle counter.
const SYS_CLK_HZ: u32 = 400_000_000;

/// USB endpoint memory
static mut EP_MEMORY: MaybeUninit<[u32; 1024]> = MaybeUninit::uninit();

/// USB I/O buffer for mass storage, one 4 KiB transfer chunk
static mut USB_BUF: [u8; 4096] = [0u8; 4096];

/// Wrapper for static buffer that implements BorrowMut<[u8]>
struct StaticBuffer(&'static mut [u8]);

impl BorrowMut<[u8]> for StaticBuffer {
    fn borrow_mut(&mut self) -> &mut [u8] {
        self.0
    }
}

impl Borrow<[u8]> for StaticBuffer {
    fn borrow(&self) -> &[u8] {
        self.0
    }
}

/// Write activity LED on PE6.
struct StatusLed(gpio::PE6<Output<PushPull>>);

impl ActivityLed for StatusLed {
    fn set_active(&mut self, on: bool) {
        if on {
            self.0.set_high();
        } else {
            self.0.set_low();
        }
    }
}

type Nor = SpiNor<spi::Spi<pac::SPI1, spi::Enabled, u8>, gpio::PA4<Output<PushPull>>>;
type Disk = CachedFlash<Nor>;

/// Blinks the LED forever after a fatal bring-up error.
fn halt(led: &mut gpio::PE6<Output<PushPull>>) -> ! {
    loop {
        led.toggle();
        cortex_m::asm::delay(40_000_000);
    }
}

fn list(view: &RefCell<FatView<'_, Disk>>) {
    let mut out = LineWriter::<_, 128>::new(|line: &str| info!("{=str}", line));
    match list_files(&mut view.borrow_mut(), &mut out) {
        Ok(listing) => debug!("listed {} files, {} bytes", listing.files, listing.bytes),
        Err(ListError::NotFormatted) => {}
        Err(e) => warn!("listing failed: {}", e),
    }
}

#[entry]
fn main() -> ! {
    info!("SPI flash USB Mass Storage starting...");

    // Take peripherals
    let dp = pac::Peripherals::take().unwrap();
    let mut cp = cortex_m::Peripherals::take().unwrap();

    // Cycle counter drives the listing interval
    cp.DCB.enable_trace();
    cp.DWT.enable_cycle_counter();

    // Configure power and clocks
    let pwr = dp.PWR.constrain();
    let vos = pwr.freeze();

    let rcc = dp.RCC.constrain();
    let mut ccdr = rcc
        .sys_ck(SYS_CLK_HZ.Hz())
        .pll1_q_ck(100.MHz())
        .freeze(vos, &dp.SYSCFG);

    // HSI48 is always enabled on H7, verify and configure for USB
    let _ = ccdr.clocks.hsi48_ck().expect("HSI48 must be running for USB");
    ccdr.peripheral.kernel_usb_clk_mux(UsbClkSel::Hsi48);
    info!("HSI48 clock configured for USB");

    // Configure GPIO ports
    let gpioa = dp.GPIOA.split(ccdr.peripheral.GPIOA);
    let gpioe = dp.GPIOE.split(ccdr.peripheral.GPIOE);

    // Configure status LED (PE6)
    let mut led = gpioe.pe6.into_push_pull_output();
    led.set_low();

    // Configure SPI1 for the flash chip
    let sck = gpioa.pa5.into_alternate::<5>();
    let miso = gpioa.pa6.into_alternate::<5>();
    let mosi = gpioa.pa7.into_alternate::<5>();
    let mut cs = gpioa.pa4.into_push_pull_output();
    cs.set_high();

    let spi: spi::Spi<_, _, u8> = dp.SPI1.spi(
        (sck, miso, mosi),
        spi::MODE_0,
        25.MHz(),
        ccdr.peripheral.SPI1,
        &ccdr.clocks,
    );

    info!("Initializing SPI flash...");

    let nor = match SpiNor::new(spi, cs) {
        Ok(nor) => nor,
        Err(e) => {
            error!("SPI flash init failed: {}", e);
            halt(&mut led);
        }
    };
    let disk = match CachedFlash::new(nor) {
        Ok(disk) => disk,
        Err(e) => {
            error!("SPI flash geometry not supported: {}", e);
            halt(&mut led);
        }
    };
    let size = disk.size();
    info!(
        "SPI flash: {} bytes, {} blocks ({} KB)",
        size,
        disk.block_count(),
        size / 1024
    );

    // Shared by the USB bridge and the local listing for the rest of the program
    let device = RefCell::new(disk);
    let view = RefCell::new(FatView::mount(&device, FixedTime));
    let formatted = view.borrow().formatted();

    let mut disk = ScsiDisk::new(Bridge::new(&device, &view, StatusLed(led)), IDENTITY);

    // Configure USB2 pins (PA11 = DM, PA12 = DP) with Alternate<10>
    let usb_dm = gpioa.pa11.into_alternate::<10>();
    let usb_dp = gpioa.pa12.into_alternate::<10>();

    info!("Initializing USB2...");

    // Create USB2 peripheral (OTG2_HS with internal FS PHY)
    let usb = USB2::new(
        dp.OTG2_HS_GLOBAL,
        dp.OTG2_HS_DEVICE,
        dp.OTG2_HS_PWRCLK,
        usb_dm,
        usb_dp,
        ccdr.peripheral.USB2OTG,
        &ccdr.clocks,
    );

    // Initialize EP_MEMORY to zero
    let ep_mem = unsafe {
        let buf: &mut [MaybeUninit<u32>; 1024] =
            &mut *(core::ptr::addr_of_mut!(EP_MEMORY) as *mut _);
        for value in buf.iter_mut() {
            value.as_mut_ptr().write(0);
        }
        (*core::ptr::addr_of_mut!(EP_MEMORY)).assume_init_mut()
    };

    let usb_bus = UsbBus::new(usb, ep_mem);

    // Single LUN over Bulk-Only Transport
    let usb_buf = StaticBuffer(unsafe { &mut *core::ptr::addr_of_mut!(USB_BUF) });
    let mut msc = Scsi::new(&usb_bus, PACKET_SIZE, 0, usb_buf)
        .expect("Failed to create SCSI device");

    let mut usb_dev = UsbDeviceBuilder::new(&usb_bus, UsbVidPid(USB_VID, USB_PID))
        .strings(&[StringDescriptors::default()
            .manufacturer(USB_MANUFACTURER)
            .product(USB_PRODUCT)
            .serial_number(USB_SERIAL)])
        .expect("Failed to set USB strings")
        .device_class(0x00)
        .max_packet_size_0(64)
        .expect("Invalid max_packet_size")
        .build();

    if formatted {
        info!("USB Mass Storage ready");
    } else {
        warn!("Failed to init file system, flash may not be formatted");
    }

    list(&view);

    let mut every = Interval::new(
        Interval::ticks_from_ms(LIST_INTERVAL_MS, SYS_CLK_HZ),
        DWT::cycle_count(),
    );

    // Main loop
    loop {
        if usb_dev.poll(&mut [&mut msc]) {
            disk.poll(&mut msc);
        }

        if every.poll(DWT::cycle_count()) {
            disk.service();
            if disk.handler().sync_pending() {
                match disk.handler_mut().flush() {
                    Ok(()) => info!("flash sync recovered"),
                    Err(e) => warn!("flash sync retry failed: {:?}", e),
                }
            }
            list(&view);
        }
    }
}
