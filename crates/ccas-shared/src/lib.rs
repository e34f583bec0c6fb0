use bytes::Bytes;

// Diameter Command Codes
pub const CMD_CREDIT_CONTROL: u32 = 272; // CCR / CCA
pub const CMD_RE_AUTH: u32 = 258; // RAR / RAA

// AVP Codes
pub const AVP_RESULT_CODE: u32 = 268;
pub const AVP_AUTH_APPLICATION_ID: u32 = 258;
pub const AVP_CC_REQUEST_TYPE: u32 = 416;
pub const AVP_CC_REQUEST_NUMBER: u32 = 415;
pub const AVP_VALIDITY_TIME: u32 = 448;

// CC-Request-Type values (AVP 416)
pub const CC_REQUEST_TYPE_INITIAL: u32 = 1;
pub const CC_REQUEST_TYPE_UPDATE: u32 = 2;
pub const CC_REQUEST_TYPE_TERMINATION: u32 = 3;
pub const CC_REQUEST_TYPE_EVENT: u32 = 4;

// Result-Code values (AVP 268)
pub const RESULT_CODE_SUCCESS: u32 = 2001; // DIAMETER_SUCCESS
pub const RESULT_CODE_UNABLE_TO_COMPLY: u32 = 5012; // DIAMETER_UNABLE_TO_COMPLY

/// Provisional class: 1xxx
pub fn is_provisional(result_code: u32) -> bool {
    (1000..2000).contains(&result_code)
}

/// Success class: 2xxx. Everything outside 1xxx/2xxx counts as failure.
pub fn is_success(result_code: u32) -> bool {
    (2000..3000).contains(&result_code)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    pub vendor_id: Option<u32>,
    pub data: Bytes, // Zero-copy friendly
}

impl Avp {
    /// Build a mandatory Unsigned32 AVP
    pub fn unsigned32(code: u32, value: u32) -> Self {
        Self {
            code,
            flags: 0x40, // Mandatory
            vendor_id: None,
            data: Bytes::from(value.to_be_bytes().to_vec()),
        }
    }

    /// Read the payload as an Unsigned32, if it is exactly 4 bytes
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiameterMessage {
    pub version: u8,
    pub flags: u8,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
    pub is_request: bool,
    pub avps: Vec<Avp>,
}

impl DiameterMessage {
    pub fn new(command_code: u32, is_request: bool) -> Self {
        Self {
            version: 1,
            flags: if is_request { 0x80 } else { 0x00 },
            command_code,
            application_id: 4, // Diameter Credit Control
            hop_by_hop_id: 0,
            end_to_end_id: 0,
            is_request,
            avps: Vec::new(),
        }
    }

    // Helper: Get specific AVP
    pub fn get_avp(&self, code: u32) -> Option<&Avp> {
        self.avps.iter().find(|a| a.code == code)
    }

    // Helper: Add or replace AVP
    pub fn set_avp(&mut self, avp: Avp) {
        if let Some(existing) = self.avps.iter_mut().find(|a| a.code == avp.code) {
            *existing = avp;
        } else {
            self.avps.push(avp);
        }
    }

    /// Read an Unsigned32 AVP payload by code
    pub fn get_u32(&self, code: u32) -> Option<u32> {
        self.get_avp(code).and_then(Avp::as_u32)
    }

    // Helper: Check message type
    pub fn is_ccr(&self) -> bool {
        self.command_code == CMD_CREDIT_CONTROL && self.is_request
    }
    pub fn is_cca(&self) -> bool {
        self.command_code == CMD_CREDIT_CONTROL && !self.is_request
    }
    pub fn is_rar(&self) -> bool {
        self.command_code == CMD_RE_AUTH && self.is_request
    }
    pub fn is_raa(&self) -> bool {
        self.command_code == CMD_RE_AUTH && !self.is_request
    }
}
