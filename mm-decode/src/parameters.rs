// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle as _;
use bytes::Bytes;
use hashbrown::HashMap;
use slotmap::SlotMap;
use tracing::{debug, trace};

use crate::codec::VideoCodec;
use crate::device::DeviceRef;
use crate::error::{DecodeError, Result};

pub const MAX_VPS_IDS: u32 = 16;
pub const MAX_SPS_IDS: u32 = 32;
pub const MAX_PPS_IDS: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParameterKind {
    Vps,
    Sps,
    Pps,
    Av1Sequence,
}

impl ParameterKind {
    pub fn name(&self) -> &'static str {
        match self {
            ParameterKind::Vps => "VPS",
            ParameterKind::Sps => "SPS",
            ParameterKind::Pps => "PPS",
            ParameterKind::Av1Sequence => "AV1 sequence header",
        }
    }

    fn max_ids(&self) -> u32 {
        match self {
            ParameterKind::Vps => MAX_VPS_IDS,
            ParameterKind::Sps => MAX_SPS_IDS,
            ParameterKind::Pps => MAX_PPS_IDS,
            ParameterKind::Av1Sequence => 1,
        }
    }
}

/// The codec-specific contents of a parameter set, as produced by the
/// parser.
#[derive(Clone)]
pub enum StdParameterSet {
    H264Sps(vk::native::StdVideoH264SequenceParameterSet),
    H264Pps(vk::native::StdVideoH264PictureParameterSet),
    H265Vps(vk::native::StdVideoH265VideoParameterSet),
    H265Sps(vk::native::StdVideoH265SequenceParameterSet),
    H265Pps(vk::native::StdVideoH265PictureParameterSet),
    /// AV1 sequence headers are passed through opaquely.
    Av1Sequence { seq_profile: u8, header: Bytes },
}

impl std::fmt::Debug for StdParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdParameterSet::H264Sps(_) => write!(f, "H264Sps"),
            StdParameterSet::H264Pps(_) => write!(f, "H264Pps"),
            StdParameterSet::H265Vps(_) => write!(f, "H265Vps"),
            StdParameterSet::H265Sps(_) => write!(f, "H265Sps"),
            StdParameterSet::H265Pps(_) => write!(f, "H265Pps"),
            StdParameterSet::Av1Sequence { seq_profile, .. } => {
                write!(f, "Av1Sequence({})", seq_profile)
            }
        }
    }
}

/// Ids identifying a parameter set and the sets it depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterIds {
    pub vps: Option<u32>,
    pub sps: Option<u32>,
    pub pps: Option<u32>,
}

/// One parameter set, ready to be written into a session parameters object.
///
/// The std structures may point at auxiliary data (scaling lists, VUI, and so
/// on). That data is owned by `storage`, which lives as long as the set.
pub struct ParameterSet {
    std: StdParameterSet,
    ids: ParameterIds,
    update_sequence_count: u32,
    _storage: Option<Box<dyn Any + Send + Sync>>,
}

// The raw pointers inside the std structures only point into `_storage`.
unsafe impl Send for ParameterSet {}
unsafe impl Sync for ParameterSet {}

impl std::fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSet")
            .field("std", &self.std)
            .field("ids", &self.ids)
            .field("update_sequence_count", &self.update_sequence_count)
            .finish()
    }
}

impl ParameterSet {
    pub fn new(std: StdParameterSet, update_sequence_count: u32) -> Result<Self> {
        let ids = match &std {
            StdParameterSet::H264Sps(sps) => ParameterIds {
                sps: Some(sps.seq_parameter_set_id as u32),
                ..Default::default()
            },
            StdParameterSet::H264Pps(pps) => ParameterIds {
                sps: Some(pps.seq_parameter_set_id as u32),
                pps: Some(pps.pic_parameter_set_id as u32),
                ..Default::default()
            },
            StdParameterSet::H265Vps(vps) => ParameterIds {
                vps: Some(vps.vps_video_parameter_set_id as u32),
                ..Default::default()
            },
            StdParameterSet::H265Sps(sps) => ParameterIds {
                vps: Some(sps.sps_video_parameter_set_id as u32),
                sps: Some(sps.sps_seq_parameter_set_id as u32),
                pps: None,
            },
            StdParameterSet::H265Pps(pps) => ParameterIds {
                vps: Some(pps.sps_video_parameter_set_id as u32),
                sps: Some(pps.pps_seq_parameter_set_id as u32),
                pps: Some(pps.pps_pic_parameter_set_id as u32),
            },
            StdParameterSet::Av1Sequence { .. } => ParameterIds::default(),
        };

        for (kind, id) in [
            (ParameterKind::Vps, ids.vps),
            (ParameterKind::Sps, ids.sps),
            (ParameterKind::Pps, ids.pps),
        ] {
            match id {
                Some(id) if id >= kind.max_ids() => {
                    return Err(DecodeError::ParameterIdOutOfRange {
                        kind: kind.name(),
                        id,
                        max: kind.max_ids() - 1,
                    })
                }
                _ => (),
            }
        }

        Ok(Self {
            std,
            ids,
            update_sequence_count,
            _storage: None,
        })
    }

    /// Attaches data referenced by pointers inside the std structure.
    pub fn with_storage(mut self, storage: Box<dyn Any + Send + Sync>) -> Self {
        self._storage = Some(storage);
        self
    }

    pub fn std(&self) -> &StdParameterSet {
        &self.std
    }

    pub fn codec(&self) -> VideoCodec {
        match self.std {
            StdParameterSet::H264Sps(_) | StdParameterSet::H264Pps(_) => VideoCodec::H264,
            StdParameterSet::H265Vps(_)
            | StdParameterSet::H265Sps(_)
            | StdParameterSet::H265Pps(_) => VideoCodec::H265,
            StdParameterSet::Av1Sequence { .. } => VideoCodec::Av1,
        }
    }

    pub fn kind(&self) -> ParameterKind {
        match self.std {
            StdParameterSet::H265Vps(_) => ParameterKind::Vps,
            StdParameterSet::H264Sps(_) | StdParameterSet::H265Sps(_) => ParameterKind::Sps,
            StdParameterSet::H264Pps(_) | StdParameterSet::H265Pps(_) => ParameterKind::Pps,
            StdParameterSet::Av1Sequence { .. } => ParameterKind::Av1Sequence,
        }
    }

    /// The id of the set itself.
    pub fn id(&self) -> u32 {
        match self.kind() {
            ParameterKind::Vps => self.ids.vps,
            ParameterKind::Sps => self.ids.sps,
            ParameterKind::Pps => self.ids.pps,
            ParameterKind::Av1Sequence => Some(0),
        }
        .unwrap_or_default()
    }

    pub fn ids(&self) -> &ParameterIds {
        &self.ids
    }

    pub fn update_sequence_count(&self) -> u32 {
        self.update_sequence_count
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct UsedIds {
    vps: u16,
    sps: u32,
    pps: [u64; 4],
    av1_sequence: bool,
}

impl UsedIds {
    fn insert(&mut self, kind: ParameterKind, id: u32) {
        match kind {
            ParameterKind::Vps => self.vps |= 1 << id,
            ParameterKind::Sps => self.sps |= 1 << id,
            ParameterKind::Pps => self.pps[(id / 64) as usize] |= 1 << (id % 64),
            ParameterKind::Av1Sequence => self.av1_sequence = true,
        }
    }

    fn contains(&self, kind: ParameterKind, id: u32) -> bool {
        if id >= kind.max_ids() {
            return false;
        }

        match kind {
            ParameterKind::Vps => self.vps & (1 << id) != 0,
            ParameterKind::Sps => self.sps & (1 << id) != 0,
            ParameterKind::Pps => self.pps[(id / 64) as usize] & (1 << (id % 64)) != 0,
            ParameterKind::Av1Sequence => self.av1_sequence,
        }
    }
}

slotmap::new_key_type! {
    pub struct ParametersKey;
}

struct ParametersObject {
    id: Option<u64>,
    handle: vk::VideoSessionParametersKHR,
    template: Option<ParametersKey>,
    pending: VecDeque<Arc<ParameterSet>>,
    used: UsedIds,
    update_count: u32,
    refs: Arc<()>,
}

/// A reference to a session parameters object, held by the parser and by
/// frames in flight. The object stays alive while any reference exists.
#[derive(Debug, Clone)]
pub struct ParametersRef {
    key: ParametersKey,
    _token: Arc<()>,
}

/// Session parameters objects, kept in an arena. The latest set for every
/// kind and id is retained, so that it can be replayed into a new session.
pub struct PictureParametersCache {
    device: DeviceRef,
    session: vk::VideoSessionKHR,
    codec: Option<VideoCodec>,
    objects: SlotMap<ParametersKey, ParametersObject>,
    current: Option<ParametersKey>,
    latest: HashMap<(ParameterKind, u32), Arc<ParameterSet>>,
    next_id: u64,
}

impl PictureParametersCache {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            session: vk::VideoSessionKHR::null(),
            codec: None,
            objects: SlotMap::with_key(),
            current: None,
            latest: HashMap::new(),
            next_id: 0,
        }
    }

    /// Adds a parameter set. Sets with a non-zero update sequence count
    /// start a new object, which inherits from the current one. With a bound
    /// session the set is written immediately, otherwise it is queued until
    /// a session exists.
    pub fn add(&mut self, set: ParameterSet) -> Result<ParametersRef> {
        let set = Arc::new(set);
        let codec = set.codec();

        if self.codec != Some(codec) {
            if self.codec.is_some() {
                debug!(%codec, "codec changed, dropping cached parameter sets");
            }

            self.latest.clear();
            self.current = None;
            self.codec = Some(codec);
        }

        self.latest.insert((set.kind(), set.id()), set.clone());

        let bound = !self.session.is_null();
        if bound {
            if let Some(current) = self.current {
                self.flush_object(current)?;
            }
        }

        let key = match self.current {
            Some(current)
                if set.update_sequence_count() == 0 && codec.supports_parameter_templates() =>
            {
                current
            }
            current => {
                let template = current.filter(|_| codec.supports_parameter_templates());
                self.insert_object(template)
            }
        };

        trace!(kind = set.kind().name(), id = set.id(), "adding parameter set");
        self.objects[key].pending.push_back(set);
        self.current = Some(key);

        if bound {
            self.flush_object(key)?;
        }

        self.retire();
        Ok(self.reference(key))
    }

    /// Binds the cache to a newly created session. Every existing object
    /// belongs to the old session, so they are all destroyed and the latest
    /// sets are replayed into a fresh object. The device must be idle.
    pub fn bind_session(&mut self, session: vk::VideoSessionKHR) -> Result<()> {
        if session == self.session {
            return Ok(());
        }

        for (_, obj) in self.objects.drain() {
            if !obj.handle.is_null() {
                self.device.destroy_session_parameters(obj.handle);
            }
        }

        self.session = session;
        self.current = None;

        if self.latest.is_empty() {
            return Ok(());
        }

        let mut sets = self.latest.values().cloned().collect::<Vec<_>>();
        sets.sort_by_key(|set| (set.kind(), set.id()));

        let key = self.insert_object(None);
        self.objects[key].pending.extend(sets);
        self.current = Some(key);
        self.flush_object(key)?;

        debug!(
            object_id = self.objects[key].id,
            "replayed parameter sets into new session"
        );

        Ok(())
    }

    /// Flushes the object referenced by `params` and returns its handle,
    /// along with a reference to the object actually used. References to
    /// objects from a previous session resolve to the current object, which
    /// holds the latest version of every set.
    pub fn resolve(
        &mut self,
        params: &ParametersRef,
    ) -> Result<(vk::VideoSessionParametersKHR, ParametersRef)> {
        if self.session.is_null() {
            return Err(DecodeError::NotInitialized);
        }

        let key = if self.objects.contains_key(params.key) {
            params.key
        } else {
            trace!("stale parameters reference, using current object");
            self.current.ok_or(DecodeError::MissingParameters)?
        };

        self.flush_object(key)?;
        Ok((self.objects[key].handle, self.reference(key)))
    }

    /// Checks that the object referenced by `params` contains every set in
    /// `required`.
    pub fn validate(
        &self,
        params: &ParametersRef,
        required: &[(ParameterKind, u32)],
    ) -> Result<()> {
        let obj = self
            .objects
            .get(params.key)
            .ok_or(DecodeError::MissingParameters)?;

        for (kind, id) in required {
            if !obj.used.contains(*kind, *id) {
                return Err(DecodeError::MissingParameterSet {
                    kind: kind.name(),
                    id: *id,
                });
            }
        }

        Ok(())
    }

    /// The monotonically increasing id assigned to the object when it was
    /// created on the device.
    pub fn object_id(&self, params: &ParametersRef) -> Option<u64> {
        self.objects.get(params.key).and_then(|obj| obj.id)
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    fn insert_object(&mut self, template: Option<ParametersKey>) -> ParametersKey {
        self.objects.insert(ParametersObject {
            id: None,
            handle: vk::VideoSessionParametersKHR::null(),
            template,
            pending: VecDeque::new(),
            used: UsedIds::default(),
            update_count: 0,
            refs: Arc::new(()),
        })
    }

    fn reference(&self, key: ParametersKey) -> ParametersRef {
        ParametersRef {
            key,
            _token: self.objects[key].refs.clone(),
        }
    }

    fn flush_object(&mut self, key: ParametersKey) -> Result<()> {
        if self.objects[key].pending.is_empty() {
            return Ok(());
        }

        if self.objects[key].handle.is_null() {
            let (template_handle, used) = match self.objects[key].template {
                Some(template) if self.objects.contains_key(template) => {
                    self.flush_object(template)?;
                    let t = &self.objects[template];
                    (t.handle, t.used.clone())
                }
                _ => (vk::VideoSessionParametersKHR::null(), UsedIds::default()),
            };

            let obj = &mut self.objects[key];
            let Some(first) = obj.pending.pop_front() else {
                return Ok(());
            };

            obj.handle =
                self.device
                    .create_session_parameters(self.session, template_handle, &first)?;
            obj.used = used;
            obj.used.insert(first.kind(), first.id());
            obj.template = None;

            self.next_id += 1;
            obj.id = Some(self.next_id);

            debug!(
                object_id = self.next_id,
                inherited = !template_handle.is_null(),
                "created session parameters"
            );
        }

        let obj = &mut self.objects[key];
        while let Some(set) = obj.pending.pop_front() {
            obj.update_count += 1;
            self.device
                .update_session_parameters(obj.handle, &set, obj.update_count)?;
            obj.used.insert(set.kind(), set.id());
        }

        Ok(())
    }

    /// Destroys objects that are no longer current and no longer referenced.
    fn retire(&mut self) {
        let templates = self
            .objects
            .values()
            .filter_map(|obj| obj.template)
            .collect::<Vec<_>>();

        let retired = self
            .objects
            .iter()
            .filter(|(key, obj)| {
                Some(*key) != self.current
                    && Arc::strong_count(&obj.refs) == 1
                    && !templates.contains(key)
            })
            .map(|(key, _)| key)
            .collect::<Vec<_>>();

        for key in retired {
            if let Some(obj) = self.objects.remove(key) {
                trace!(object_id = obj.id, "retiring session parameters");
                if !obj.handle.is_null() {
                    self.device.destroy_session_parameters(obj.handle);
                }
            }
        }
    }
}

impl Drop for PictureParametersCache {
    fn drop(&mut self) {
        for (_, obj) in self.objects.drain() {
            if !obj.handle.is_null() {
                self.device.destroy_session_parameters(obj.handle);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::mock::{MockDevice, ParametersCall};
    use pretty_assertions::assert_eq;

    pub(crate) fn h264_sps(id: u8, update_sequence_count: u32) -> ParameterSet {
        let mut sps: vk::native::StdVideoH264SequenceParameterSet = unsafe { std::mem::zeroed() };
        sps.seq_parameter_set_id = id;
        ParameterSet::new(StdParameterSet::H264Sps(sps), update_sequence_count).unwrap()
    }

    pub(crate) fn h264_pps(sps_id: u8, id: u8, update_sequence_count: u32) -> ParameterSet {
        let mut pps: vk::native::StdVideoH264PictureParameterSet = unsafe { std::mem::zeroed() };
        pps.seq_parameter_set_id = sps_id;
        pps.pic_parameter_set_id = id;
        ParameterSet::new(StdParameterSet::H264Pps(pps), update_sequence_count).unwrap()
    }

    fn session(device: &MockDevice) -> vk::VideoSessionKHR {
        vk::VideoSessionKHR::from_raw(device.next_raw_handle())
    }

    #[test]
    fn queued_until_session() {
        let device = Arc::new(MockDevice::new());
        let mut cache = PictureParametersCache::new(device.clone());

        let r = cache.add(h264_sps(0, 0)).unwrap();
        cache.add(h264_pps(0, 0, 0)).unwrap();
        cache.add(h264_pps(0, 1, 0)).unwrap();
        assert!(device.parameters_calls().is_empty());
        assert_eq!(cache.object_id(&r), None);

        cache.bind_session(session(&device)).unwrap();
        let (_, used) = cache.resolve(&r).unwrap();
        assert_eq!(
            device.parameters_calls(),
            vec![
                ParametersCall::Create {
                    templated: false,
                    kind: ParameterKind::Sps,
                    id: 0
                },
                ParametersCall::Update {
                    kind: ParameterKind::Pps,
                    id: 0,
                    update_sequence_count: 1
                },
                ParametersCall::Update {
                    kind: ParameterKind::Pps,
                    id: 1,
                    update_sequence_count: 2
                },
            ]
        );

        cache
            .validate(
                &used,
                &[(ParameterKind::Sps, 0), (ParameterKind::Pps, 1)],
            )
            .unwrap();

        match cache.validate(&used, &[(ParameterKind::Pps, 7)]) {
            Err(DecodeError::MissingParameterSet { kind: "PPS", id: 7 }) => (),
            v => panic!("expected MissingParameterSet, got {:?}", v),
        }
    }

    #[test]
    fn updates_use_templates() {
        let device = Arc::new(MockDevice::new());
        let mut cache = PictureParametersCache::new(device.clone());
        cache.bind_session(session(&device)).unwrap();

        let first = cache.add(h264_sps(0, 0)).unwrap();
        cache.add(h264_pps(0, 0, 0)).unwrap();
        assert_eq!(cache.object_id(&first), Some(1));

        // A replacement SPS can't be written into the existing object.
        let second = cache.add(h264_sps(0, 1)).unwrap();
        assert_eq!(cache.object_id(&second), Some(2));

        assert_eq!(
            device.parameters_calls().last(),
            Some(&ParametersCall::Create {
                templated: true,
                kind: ParameterKind::Sps,
                id: 0
            })
        );

        // The PPS is inherited from the template.
        cache.validate(&second, &[(ParameterKind::Pps, 0)]).unwrap();

        // The first object is retired once nothing refers to it.
        assert_eq!(cache.num_objects(), 2);
        drop(first);
        cache.add(h264_pps(0, 1, 0)).unwrap();
        assert_eq!(cache.num_objects(), 1);
        assert_eq!(device.live_parameters(), 1);
    }

    #[test]
    fn replay_on_new_session() {
        let device = Arc::new(MockDevice::new());
        let mut cache = PictureParametersCache::new(device.clone());
        cache.bind_session(session(&device)).unwrap();

        let old = cache.add(h264_sps(0, 0)).unwrap();
        cache.add(h264_pps(0, 0, 0)).unwrap();
        cache.add(h264_pps(0, 0, 1)).unwrap();

        cache.bind_session(session(&device)).unwrap();
        assert_eq!(device.live_parameters(), 1);

        let (handle, used) = cache.resolve(&old).unwrap();
        assert!(!handle.is_null());
        assert_eq!(cache.object_id(&used), Some(3));
        cache
            .validate(&used, &[(ParameterKind::Sps, 0), (ParameterKind::Pps, 0)])
            .unwrap();
    }

    #[test]
    fn id_out_of_range() {
        match ParameterSet::new(
            StdParameterSet::H264Sps({
                let mut sps: vk::native::StdVideoH264SequenceParameterSet =
                    unsafe { std::mem::zeroed() };
                sps.seq_parameter_set_id = 40;
                sps
            }),
            0,
        ) {
            Err(DecodeError::ParameterIdOutOfRange { id: 40, max: 31, .. }) => (),
            v => panic!("expected ParameterIdOutOfRange, got {:?}", v),
        }
    }

    #[test]
    fn av1_never_templated() {
        let device = Arc::new(MockDevice::new());
        let mut cache = PictureParametersCache::new(device.clone());
        cache.bind_session(session(&device)).unwrap();

        let header = || {
            ParameterSet::new(
                StdParameterSet::Av1Sequence {
                    seq_profile: 0,
                    header: Bytes::from_static(&[0x0a, 0x0b]),
                },
                0,
            )
            .unwrap()
        };

        let a = cache.add(header()).unwrap();
        let b = cache.add(header()).unwrap();
        assert_eq!(cache.object_id(&a), Some(1));
        assert_eq!(cache.object_id(&b), Some(2));
        assert!(device
            .parameters_calls()
            .iter()
            .all(|call| matches!(call, ParametersCall::Create { templated: false, .. })));
    }
}
