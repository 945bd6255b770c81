use crate::format::VideoSignal;

/// The YCbCr encoding of a decoded picture. Used to configure the
/// color-conversion filter.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum YcbcrModel {
    /// The samples are already RGB (matrix_coefficients = 0).
    Identity,
    Bt601,
    Bt709,
    Bt2020,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum YcbcrRange {
    /// Luma in [16, 235], chroma in [16, 240] (scaled for higher bit depths).
    Limited,
    Full,
}

impl YcbcrModel {
    /// Picks the model from the signalled matrix coefficients, falling back
    /// to the color primaries and then the picture height.
    pub fn from_signal(signal: &VideoSignal, height: u32) -> Self {
        match signal.matrix_coefficients {
            0 => return YcbcrModel::Identity,
            1 => return YcbcrModel::Bt709,
            5 | 6 => return YcbcrModel::Bt601,
            9 | 10 => return YcbcrModel::Bt2020,
            _ => (),
        }

        match signal.color_primaries {
            1 => YcbcrModel::Bt709,
            5 | 6 => YcbcrModel::Bt601,
            9 => YcbcrModel::Bt2020,
            _ if height >= 720 => YcbcrModel::Bt709,
            _ => YcbcrModel::Bt601,
        }
    }

    /// Returns (Kr, Kb).
    fn coefficients(&self) -> (f32, f32) {
        match self {
            YcbcrModel::Identity => (0.0, 0.0),
            YcbcrModel::Bt601 => (0.299, 0.114),
            YcbcrModel::Bt709 => (0.2126, 0.0722),
            YcbcrModel::Bt2020 => (0.2627, 0.0593),
        }
    }

    /// The matrix converting range-normalized (Y, Cb, Cr) to RGB, where Cb and
    /// Cr are centered on zero. The fourth column is an offset.
    pub fn to_rgb_matrix(&self) -> [[f32; 4]; 3] {
        if *self == YcbcrModel::Identity {
            // G is stored in the luma plane, B and R in the chroma planes.
            return [
                [0.0, 0.0, 1.0, 0.5],
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.5],
            ];
        }

        let (kr, kb) = self.coefficients();
        let kg = 1.0 - kr - kb;

        [
            [1.0, 0.0, 2.0 * (1.0 - kr), 0.0],
            [
                1.0,
                -2.0 * kb * (1.0 - kb) / kg,
                -2.0 * kr * (1.0 - kr) / kg,
                0.0,
            ],
            [1.0, 2.0 * (1.0 - kb), 0.0, 0.0],
        ]
    }
}

impl YcbcrRange {
    pub fn from_signal(signal: &VideoSignal) -> Self {
        if signal.full_range {
            YcbcrRange::Full
        } else {
            YcbcrRange::Limited
        }
    }

    /// The scale and offset applied to normalized (luma, chroma) samples, so
    /// that luma lands in [0, 1] and chroma in [-0.5, 0.5].
    pub fn scale_and_offset(&self) -> ([f32; 2], [f32; 2]) {
        match self {
            YcbcrRange::Full => ([1.0, 1.0], [0.0, -128.0 / 255.0]),
            YcbcrRange::Limited => (
                [255.0 / 219.0, 255.0 / 224.0],
                [-16.0 / 219.0, -128.0 / 224.0],
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn apply(m: &[[f32; 4]; 3], ycbcr: [f32; 3]) -> [f32; 3] {
        let row = |r: &[f32; 4]| r[0] * ycbcr[0] + r[1] * ycbcr[1] + r[2] * ycbcr[2] + r[3];
        [row(&m[0]), row(&m[1]), row(&m[2])]
    }

    fn assert_close(a: [f32; 3], b: [f32; 3]) {
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-3, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn bt709_coefficients() {
        let m = YcbcrModel::Bt709.to_rgb_matrix();
        assert!((m[0][2] - 1.5748).abs() < 1e-4);
        assert!((m[2][1] - 1.8556).abs() < 1e-4);

        // Gray stays gray.
        assert_close(apply(&m, [0.5, 0.0, 0.0]), [0.5, 0.5, 0.5]);
    }

    #[test]
    fn limited_range_white() {
        let (scale, offset) = YcbcrRange::Limited.scale_and_offset();
        let y = 235.0 / 255.0 * scale[0] + offset[0];
        let c = 128.0 / 255.0 * scale[1] + offset[1];

        assert!((y - 1.0).abs() < 1e-4);
        assert!(c.abs() < 1e-4);
        assert_close(
            apply(&YcbcrModel::Bt601.to_rgb_matrix(), [y, c, c]),
            [1.0, 1.0, 1.0],
        );
    }

    #[test]
    fn model_fallbacks() {
        let mut signal = VideoSignal::default();
        assert_eq!(YcbcrModel::from_signal(&signal, 480), YcbcrModel::Bt601);
        assert_eq!(YcbcrModel::from_signal(&signal, 1080), YcbcrModel::Bt709);

        signal.color_primaries = 9;
        assert_eq!(YcbcrModel::from_signal(&signal, 480), YcbcrModel::Bt2020);

        signal.matrix_coefficients = 6;
        assert_eq!(YcbcrModel::from_signal(&signal, 2160), YcbcrModel::Bt601);
    }
}
