//! X11 screen capture using the MIT-SHM extension
//!
//! The root window is read into a shared-memory segment sized for the whole
//! screen; when XFixes is available the cursor image is alpha-composited
//! onto the frame before it is handed to the encoder.

use slatecast_core::{Error, RawFrame, Result};
use std::ptr;
use tracing::{debug, info, warn};

/// X11 screen capture of the root window
pub struct X11Capture {
    conn: xcb::Connection,
    screen_num: i32,
    shm_seg: xcb::shm::Seg,
    shm_id: i32,
    shm_addr: *mut libc::c_void,
    width: u32,
    height: u32,
    xfixes_available: bool,
}

// Safety: the X11 connection and SHM segment are only touched from the
// pipeline thread that owns this value.
unsafe impl Send for X11Capture {}

impl X11Capture {
    /// Connect to the display and attach a screen-sized SHM segment
    pub fn open(display: &str) -> Result<Self> {
        let display_arg = if display.is_empty() { None } else { Some(display) };
        let (conn, screen_num) = xcb::Connection::connect(display_arg)
            .map_err(|e| Error::X11Connection(e.to_string()))?;

        let shm_cookie = conn.send_request(&xcb::shm::QueryVersion {});
        conn.wait_for_reply(shm_cookie)
            .map_err(|_| Error::X11ExtensionMissing("MIT-SHM".to_string()))?;

        let setup = conn.get_setup();
        let screen = setup
            .roots()
            .nth(screen_num as usize)
            .ok_or_else(|| Error::X11Connection("invalid screen number".to_string()))?;
        let width = screen.width_in_pixels() as u32;
        let height = screen.height_in_pixels() as u32;

        info!("Connected to X11 display: {}x{}", width, height);

        let buffer_size = (width * height * 4) as usize;

        let shm_id = unsafe { libc::shmget(libc::IPC_PRIVATE, buffer_size, libc::IPC_CREAT | 0o600) };
        if shm_id < 0 {
            return Err(Error::Capture(format!(
                "shmget failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let shm_addr = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if shm_addr == libc::MAP_FAILED {
            unsafe { libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut()) };
            return Err(Error::Capture(format!(
                "shmat failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let shm_seg: xcb::shm::Seg = conn.generate_id();
        conn.send_request(&xcb::shm::Attach {
            shmseg: shm_seg,
            shmid: shm_id as u32,
            read_only: false,
        });
        conn.flush().map_err(|e| Error::X11Connection(e.to_string()))?;

        // Cursor capture is optional
        let xfixes_cookie = conn.send_request(&xcb::xfixes::QueryVersion {
            client_major_version: 4,
            client_minor_version: 0,
        });
        let xfixes_available = conn.wait_for_reply(xfixes_cookie).is_ok();
        if !xfixes_available {
            warn!("XFixes extension not available, cursor will not be visible");
        }

        debug!("X11 capture initialized: {}x{}, SHM {} bytes", width, height, buffer_size);

        Ok(Self {
            conn,
            screen_num,
            shm_seg,
            shm_id,
            shm_addr,
            width,
            height,
            xfixes_available,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Capture one frame into an owned BGRA buffer
    pub fn capture(&mut self) -> Result<Option<RawFrame>> {
        let setup = self.conn.get_setup();
        let screen = setup
            .roots()
            .nth(self.screen_num as usize)
            .ok_or_else(|| Error::X11Connection("invalid screen number".to_string()))?;
        let root = screen.root();

        let cookie = self.conn.send_request(&xcb::shm::GetImage {
            drawable: xcb::x::Drawable::Window(root),
            x: 0,
            y: 0,
            width: self.width as u16,
            height: self.height as u16,
            plane_mask: !0,
            format: xcb::x::ImageFormat::ZPixmap as u8,
            shmseg: self.shm_seg,
            offset: 0,
        });

        if let Err(e) = self.conn.wait_for_reply(cookie) {
            debug!("GetImage failed, retrying next tick: {:?}", e);
            return Ok(None);
        }

        if self.xfixes_available {
            self.composite_cursor();
        }

        let buffer_size = (self.width * self.height * 4) as usize;
        let data = unsafe {
            std::slice::from_raw_parts(self.shm_addr as *const u8, buffer_size).to_vec()
        };

        Ok(Some(RawFrame::new(
            data,
            self.width,
            self.height,
            (self.width * 4) as usize,
        )))
    }

    /// Alpha-blend the XFixes cursor image onto the SHM frame
    fn composite_cursor(&mut self) {
        let cookie = self.conn.send_request(&xcb::xfixes::GetCursorImage {});
        let cursor = match self.conn.wait_for_reply(cookie) {
            Ok(reply) => reply,
            Err(_) => return,
        };

        let cursor_data = cursor.cursor_image();
        let cursor_w = cursor.width() as i32;
        let cursor_h = cursor.height() as i32;
        let origin_x = cursor.x() as i32 - cursor.xhot() as i32;
        let origin_y = cursor.y() as i32 - cursor.yhot() as i32;

        let frame = unsafe {
            std::slice::from_raw_parts_mut(
                self.shm_addr as *mut u8,
                (self.width * self.height * 4) as usize,
            )
        };

        for cy in 0..cursor_h {
            let sy = origin_y + cy;
            if sy < 0 || sy >= self.height as i32 {
                continue;
            }
            for cx in 0..cursor_w {
                let sx = origin_x + cx;
                if sx < 0 || sx >= self.width as i32 {
                    continue;
                }

                // Cursor pixels are ARGB words
                let pixel = cursor_data[(cy * cursor_w + cx) as usize];
                let a = ((pixel >> 24) & 0xff) as u32;
                if a == 0 {
                    continue;
                }
                let r = ((pixel >> 16) & 0xff) as u32;
                let g = ((pixel >> 8) & 0xff) as u32;
                let b = (pixel & 0xff) as u32;

                let idx = ((sy as u32 * self.width + sx as u32) * 4) as usize;
                if a == 255 {
                    frame[idx] = b as u8;
                    frame[idx + 1] = g as u8;
                    frame[idx + 2] = r as u8;
                    frame[idx + 3] = 255;
                } else {
                    let inv = 255 - a;
                    frame[idx] = ((b * a + frame[idx] as u32 * inv) / 255) as u8;
                    frame[idx + 1] = ((g * a + frame[idx + 1] as u32 * inv) / 255) as u8;
                    frame[idx + 2] = ((r * a + frame[idx + 2] as u32 * inv) / 255) as u8;
                    frame[idx + 3] = 255;
                }
            }
        }
    }
}

impl Drop for X11Capture {
    fn drop(&mut self) {
        self.conn.send_request(&xcb::shm::Detach { shmseg: self.shm_seg });
        let _ = self.conn.flush();

        unsafe {
            libc::shmdt(self.shm_addr);
            libc::shmctl(self.shm_id, libc::IPC_RMID, ptr::null_mut());
        }

        debug!("X11 capture resources cleaned up");
    }
}
