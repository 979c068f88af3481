//! Synthetic redo stream generation.
//!
//! Builders for single records and whole log files in the exact layout the
//! reader and parser validate: sealed block headers, LWN extensions, field
//! alignment. The test-suites (unit and integration) drive the pipeline
//! with these; they are also handy for offline demos against a file sink.

use crate::parser::record::{
    ColumnValue, BODY_PREAMBLE_SIZE, LWN_EXT_SIZE, RECORD_HEADER_SIZE, VLD_LWN_START,
};
use crate::reader::{block_checksum, block_size_marker, BLOCK_HEADER_SIZE, ENDIAN_MAGIC_LE,
    FH_BLOCK_SIZE, FH_ENDIAN, RH_ACTIVATION, RH_FIRST_SCN, RH_FIRST_TIME, RH_NEXT_SCN,
    RH_NEXT_TIME, RH_NUM_BLOCKS, RH_RESETLOGS, RH_SID, RH_VERSION};
use crate::types::{Scn, Xid};
use bytes::BufMut;

#[derive(Debug, Clone)]
enum RowShape {
    None,
    Single { dba: u32, slot: u16, columns: Vec<(u16, ColumnValue)> },
    Update { dba: u32, slot: u16, before: Vec<(u16, ColumnValue)>, after: Vec<(u16, ColumnValue)> },
    Multi { dba: u32, rows: Vec<(u16, Vec<(u16, ColumnValue)>)> },
}

/// Builds one record in wire form.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    layer: u8,
    code: u8,
    flags: u16,
    obj: u32,
    xid: Xid,
    scn: Scn,
    sub_scn: u16,
    lwn: Option<(u16, u16, u32, Scn, u32)>,
    fields: Vec<Vec<u8>>,
    row: RowShape,
}

impl RecordBuilder {
    pub fn new(layer: u8, code: u8, xid: Xid) -> Self {
        RecordBuilder {
            layer,
            code,
            flags: 0,
            obj: 0,
            xid,
            scn: Scn::ZERO,
            sub_scn: 0,
            lwn: None,
            fields: Vec::new(),
            row: RowShape::None,
        }
    }

    pub fn scn(mut self, scn: Scn) -> Self {
        self.scn = scn;
        self
    }

    pub fn sub_scn(mut self, sub_scn: u16) -> Self {
        self.sub_scn = sub_scn;
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn obj(mut self, obj: u32) -> Self {
        self.obj = obj;
        self
    }

    /// Mark this record as an LWN start and set the extension fields.
    pub fn lwn(mut self, num: u16, num_max: u16, blocks: u32, scn: Scn, timestamp: u32) -> Self {
        self.lwn = Some((num, num_max, blocks, scn, timestamp));
        self
    }

    pub fn raw_field(mut self, bytes: Vec<u8>) -> Self {
        self.fields.push(bytes);
        self
    }

    pub fn text_field(self, text: &str) -> Self {
        self.raw_field(text.as_bytes().to_vec())
    }

    /// Single-row descriptor for insert/delete/supplemental records.
    pub fn row(mut self, dba: u32, slot: u16) -> Self {
        self.row = RowShape::Single { dba, slot, columns: Vec::new() };
        self
    }

    pub fn column(mut self, col: u16, value: ColumnValue) -> Self {
        match &mut self.row {
            RowShape::Single { columns, .. } => columns.push((col, value)),
            RowShape::Multi { rows, .. } => {
                rows.last_mut().expect("multi_row before column").1.push((col, value))
            }
            _ => panic!("column() without a row shape"),
        }
        self
    }

    pub fn update_row(mut self, dba: u32, slot: u16) -> Self {
        self.row = RowShape::Update { dba, slot, before: Vec::new(), after: Vec::new() };
        self
    }

    pub fn before_column(mut self, col: u16, value: ColumnValue) -> Self {
        match &mut self.row {
            RowShape::Update { before, .. } => before.push((col, value)),
            _ => panic!("before_column() without update_row()"),
        }
        self
    }

    pub fn after_column(mut self, col: u16, value: ColumnValue) -> Self {
        match &mut self.row {
            RowShape::Update { after, .. } => after.push((col, value)),
            _ => panic!("after_column() without update_row()"),
        }
        self
    }

    pub fn multi(mut self, dba: u32) -> Self {
        self.row = RowShape::Multi { dba, rows: Vec::new() };
        self
    }

    pub fn multi_row(mut self, slot: u16) -> Self {
        match &mut self.row {
            RowShape::Multi { rows, .. } => rows.push((slot, Vec::new())),
            _ => panic!("multi_row() without multi()"),
        }
        self
    }

    /// Undo target for a partial rollback record.
    pub fn undo_target(self, dba: u32, slot: u16) -> Self {
        let mut field = Vec::new();
        field.put_u32_le(dba);
        field.put_u16_le(slot);
        field.put_u16_le(0);
        self.raw_field(field)
    }

    pub fn ddl(self, ddl_type: u16, sql: &str, name: &str) -> Self {
        let mut head = Vec::new();
        head.put_u16_le(ddl_type);
        head.put_u16_le(0);
        self.raw_field(head)
            .text_field(sql)
            .text_field(name)
    }

    pub fn lob_write(self, lob_id: u64, page_no: u32, data: &[u8]) -> Self {
        let mut head = Vec::new();
        head.put_u64_le(lob_id);
        head.put_u32_le(page_no);
        self.raw_field(head).raw_field(data.to_vec())
    }

    fn column_field(col: u16, value: &ColumnValue) -> Vec<u8> {
        let mut field = Vec::new();
        crate::parser::record::ColumnRef { col, value: value.clone() }.write(&mut field);
        field
    }

    fn final_fields(&self) -> Vec<Vec<u8>> {
        let mut fields = Vec::new();
        match &self.row {
            RowShape::None => {}
            RowShape::Single { dba, slot, columns } => {
                let mut head = Vec::new();
                head.put_u32_le(*dba);
                head.put_u16_le(*slot);
                head.put_u16_le(columns.len() as u16);
                fields.push(head);
                for (col, value) in columns {
                    fields.push(Self::column_field(*col, value));
                }
            }
            RowShape::Update { dba, slot, before, after } => {
                let mut head = Vec::new();
                head.put_u32_le(*dba);
                head.put_u16_le(*slot);
                head.put_u16_le(before.len() as u16);
                head.put_u16_le(after.len() as u16);
                fields.push(head);
                for (col, value) in before.iter().chain(after.iter()) {
                    fields.push(Self::column_field(*col, value));
                }
            }
            RowShape::Multi { dba, rows } => {
                let mut head = Vec::new();
                head.put_u32_le(*dba);
                head.put_u16_le(rows.len() as u16);
                head.put_u16_le(0);
                fields.push(head);
                for (slot, columns) in rows {
                    let mut row_head = Vec::new();
                    row_head.put_u16_le(*slot);
                    row_head.put_u16_le(columns.len() as u16);
                    fields.push(row_head);
                    for (col, value) in columns {
                        fields.push(Self::column_field(*col, value));
                    }
                }
            }
        }
        fields.extend(self.fields.iter().cloned());
        fields
    }

    /// Total wire size, before building.
    pub fn wire_size(&self) -> usize {
        let mut size = RECORD_HEADER_SIZE + BODY_PREAMBLE_SIZE;
        if self.lwn.is_some() {
            size += LWN_EXT_SIZE;
        }
        for field in self.final_fields() {
            size += 4 + ((field.len() + 3) & !3);
        }
        (size + 3) & !3
    }

    pub fn build(&self) -> Vec<u8> {
        let size = self.wire_size();
        let mut out = Vec::with_capacity(size);
        out.put_u32_le(size as u32);
        let vld = 0x01 | if self.lwn.is_some() { VLD_LWN_START } else { 0 };
        out.put_u8(vld);
        out.put_u8(0);
        out.put_u16_le((self.scn.0 >> 32) as u16);
        out.put_u32_le(self.scn.0 as u32);
        out.put_u16_le(self.sub_scn);
        out.put_u16_le(0);
        out.put_u32_le(0);
        debug_assert_eq!(out.len(), RECORD_HEADER_SIZE);

        if let Some((num, num_max, blocks, scn, timestamp)) = self.lwn {
            out.put_u16_le(num);
            out.put_u16_le(num_max);
            out.put_u32_le(blocks);
            out.put_u64_le(scn.0);
            out.put_u32_le(timestamp);
            out.put_u32_le(0);
        }

        out.put_u8(self.layer);
        out.put_u8(self.code);
        out.put_u16_le(self.flags);
        out.put_u32_le(self.obj);
        out.put_u64_le(self.xid.0);

        for field in self.final_fields() {
            out.put_u16_le(field.len() as u16);
            out.put_u16_le(0);
            out.extend_from_slice(&field);
            while out.len() % 4 != 0 {
                out.put_u8(0);
            }
        }
        while out.len() % 4 != 0 {
            out.put_u8(0);
        }
        debug_assert_eq!(out.len(), size);
        out
    }
}

/// Builds a whole log file: header blocks plus LWN groups packed into
/// sealed data blocks.
pub struct LogFileBuilder {
    block_size: u32,
    sequence: u32,
    resetlogs: u32,
    activation: u32,
    version: u32,
    first_scn: Scn,
    next_scn: Scn,
    first_time: u32,
    next_time: u32,
    sid: String,
    lwns: Vec<(Scn, u32, Vec<RecordBuilder>)>,
}

impl LogFileBuilder {
    pub fn new(block_size: u32, sequence: u32) -> Self {
        LogFileBuilder {
            block_size,
            sequence,
            resetlogs: 1,
            activation: 1,
            version: 0x1312_0000,
            first_scn: Scn(1),
            next_scn: Scn::NONE,
            first_time: 1_700_000_000,
            next_time: 0,
            sid: "SYNTHDB".into(),
            lwns: Vec::new(),
        }
    }

    pub fn resetlogs(mut self, value: u32) -> Self {
        self.resetlogs = value;
        self
    }

    pub fn activation(mut self, value: u32) -> Self {
        self.activation = value;
        self
    }

    pub fn first_scn(mut self, scn: Scn) -> Self {
        self.first_scn = scn;
        self
    }

    /// A valid end SCN marks the file as finished; NONE leaves it open.
    pub fn next_scn(mut self, scn: Scn) -> Self {
        self.next_scn = scn;
        self
    }

    pub fn first_time(mut self, time: u32) -> Self {
        self.first_time = time;
        self
    }

    pub fn add_lwn(mut self, scn: Scn, timestamp: u32, records: Vec<RecordBuilder>) -> Self {
        self.lwns.push((scn, timestamp, records));
        self
    }

    fn payload_per_block(&self) -> usize {
        self.block_size as usize - BLOCK_HEADER_SIZE
    }

    /// Simulate packing to learn how many blocks an LWN occupies.
    fn lwn_block_count(&self, sizes: &[usize]) -> u32 {
        let payload = self.payload_per_block();
        let mut blocks = 1u32;
        let mut room = payload;
        for (i, size) in sizes.iter().enumerate() {
            let mut left = *size;
            // A fresh record header needs more than its 20 bytes of room;
            // the parser refuses to start a record on the last 20.
            if i > 0 && room <= RECORD_HEADER_SIZE {
                blocks += 1;
                room = payload;
            }
            while left > 0 {
                if room == 0 {
                    blocks += 1;
                    room = payload;
                }
                let take = left.min(room);
                left -= take;
                room -= take;
            }
        }
        blocks
    }

    fn seal_block(&self, block: &mut [u8], block_number: u32) {
        block[0] = 0x01;
        block[1] = block_size_marker(self.block_size);
        block[4..8].copy_from_slice(&block_number.to_le_bytes());
        block[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        let sum = block_checksum(block);
        block[14..16].copy_from_slice(&sum.to_le_bytes());
    }

    pub fn build(&self) -> Vec<u8> {
        let bs = self.block_size as usize;
        let payload = self.payload_per_block();

        // Data blocks from block 2 on.
        let mut data_blocks: Vec<Vec<u8>> = Vec::new();
        let mut room = 0usize;
        for (lwn_idx, (scn, timestamp, records)) in self.lwns.iter().enumerate() {
            // First record carries the LWN extension; size it via simulation.
            let mut first = records.first().cloned().expect("lwn without records");
            let rest = &records[1..];
            let mut sizes: Vec<usize> = Vec::with_capacity(records.len());
            first = first.lwn(lwn_idx as u16 + 1, 1, 0, *scn, *timestamp);
            sizes.push(first.wire_size());
            for r in rest {
                sizes.push(r.wire_size());
            }
            let blocks = self.lwn_block_count(&sizes);
            first = first.lwn(lwn_idx as u16 + 1, 1, blocks, *scn, *timestamp);

            // An LWN always opens a fresh block.
            room = 0;
            let mut built: Vec<Vec<u8>> = Vec::with_capacity(records.len());
            built.push(first.build());
            for r in rest {
                built.push(r.build());
            }
            for (i, bytes) in built.iter().enumerate() {
                let mut offset = 0usize;
                if (i > 0 && room <= RECORD_HEADER_SIZE) || room == 0 {
                    data_blocks.push(vec![0u8; bs]);
                    room = payload;
                }
                while offset < bytes.len() {
                    if room == 0 {
                        data_blocks.push(vec![0u8; bs]);
                        room = payload;
                    }
                    let block = data_blocks.last_mut().expect("block just pushed");
                    let at = bs - room;
                    let take = (bytes.len() - offset).min(room);
                    block[at..at + take].copy_from_slice(&bytes[offset..offset + take]);
                    offset += take;
                    room -= take;
                }
            }
        }

        // Assemble: file header, redo header, sealed data blocks.
        let mut out = vec![0u8; bs * (2 + data_blocks.len())];

        // Block 0: file header. First byte stays zero.
        out[1] = block_size_marker(self.block_size);
        out[FH_BLOCK_SIZE..FH_BLOCK_SIZE + 4].copy_from_slice(&self.block_size.to_le_bytes());
        out[FH_ENDIAN..FH_ENDIAN + 4].copy_from_slice(&ENDIAN_MAGIC_LE);

        // Block 1: redo header.
        {
            let redo = &mut out[bs..bs * 2];
            redo[RH_VERSION..RH_VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
            let sid = self.sid.as_bytes();
            redo[RH_SID..RH_SID + sid.len().min(8)].copy_from_slice(&sid[..sid.len().min(8)]);
            redo[RH_ACTIVATION..RH_ACTIVATION + 4].copy_from_slice(&self.activation.to_le_bytes());
            let num_blocks = (2 + data_blocks.len()) as u32;
            redo[RH_NUM_BLOCKS..RH_NUM_BLOCKS + 4].copy_from_slice(&num_blocks.to_le_bytes());
            redo[RH_RESETLOGS..RH_RESETLOGS + 4].copy_from_slice(&self.resetlogs.to_le_bytes());
            redo[RH_FIRST_SCN..RH_FIRST_SCN + 8].copy_from_slice(&self.first_scn.0.to_le_bytes());
            redo[RH_FIRST_TIME..RH_FIRST_TIME + 4].copy_from_slice(&self.first_time.to_le_bytes());
            redo[RH_NEXT_SCN..RH_NEXT_SCN + 8].copy_from_slice(&self.next_scn.0.to_le_bytes());
            redo[RH_NEXT_TIME..RH_NEXT_TIME + 4].copy_from_slice(&self.next_time.to_le_bytes());
            self.seal_block(redo, 1);
        }

        for (i, block) in data_blocks.iter().enumerate() {
            let start = bs * (2 + i);
            out[start..start + bs].copy_from_slice(block);
            self.seal_block(&mut out[start..start + bs], (2 + i) as u32);
        }

        out
    }

    pub fn write_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        std::fs::write(path, self.build())
    }
}
